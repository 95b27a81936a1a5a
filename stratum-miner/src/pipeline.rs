//! Hardware result pipeline.
//!
//! Every response a chip sends back passes through [`ResultPipeline`]:
//!
//! 1. Register readouts are dropped without touching the job table.
//! 2. The job handle is resolved to an owned snapshot; stale handles are
//!    dropped.
//! 3. The chip's rolled version bits are OR-ed into the job's base version
//!    and the resulting header is evaluated.
//! 4. Results above the pool difficulty in effect for that job are
//!    submitted.
//! 5. Results above the local chip difficulty raise a nonce-found event.
//! 6. Every evaluated result feeds the best-difficulty tracker.
//!
//! Steps 4 and 5 are independent of each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::board::ChipResponse;
use crate::evaluator::ShareEvaluator;
use crate::job_table::{JobHandle, JobTable};
use crate::stratum_v1::{ClientCommand, Share};
use crate::tracing::prelude::*;

/// Events for telemetry consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A result beat the local chip difficulty
    NonceFound {
        unit: u8,
        threshold: f64,
        achieved: f64,
    },

    /// A result beat every result seen before it
    BestDifficulty { difficulty: f64, handle: JobHandle },
}

/// Why a response produced no verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    RegisterResponse,
    StaleJob(JobHandle),
}

/// What happened to an evaluated result.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub handle: JobHandle,
    pub difficulty: f64,
    pub submitted: bool,
    pub nonce_found: bool,
    pub new_best: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Discarded(Discard),
    Evaluated(Verdict),
}

/// Highest difficulty seen so far, shared between tasks.
#[derive(Debug, Default)]
pub struct BestDifficulty {
    bits: AtomicU64,
}

impl BestDifficulty {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Record a difficulty; returns true if it is a new maximum.
    pub fn observe(&self, difficulty: f64) -> bool {
        self.bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (difficulty > f64::from_bits(current)).then(|| difficulty.to_bits())
            })
            .is_ok()
    }
}

pub struct ResultPipeline {
    jobs: Arc<JobTable>,
    evaluator: Arc<dyn ShareEvaluator>,
    submit_tx: mpsc::Sender<ClientCommand>,
    event_tx: mpsc::Sender<PipelineEvent>,
    best: Arc<BestDifficulty>,

    /// Local difficulty chips are configured to report at
    asic_difficulty: f64,
}

impl ResultPipeline {
    pub fn new(
        jobs: Arc<JobTable>,
        evaluator: Arc<dyn ShareEvaluator>,
        submit_tx: mpsc::Sender<ClientCommand>,
        event_tx: mpsc::Sender<PipelineEvent>,
        asic_difficulty: f64,
    ) -> Self {
        Self {
            jobs,
            evaluator,
            submit_tx,
            event_tx,
            best: Arc::new(BestDifficulty::new()),
            asic_difficulty,
        }
    }

    pub fn best_difficulty(&self) -> Arc<BestDifficulty> {
        self.best.clone()
    }

    /// Process one hardware response.
    pub async fn process(&self, response: ChipResponse) -> Outcome {
        let result = match response {
            ChipResponse::Nonce(result) => result,
            ChipResponse::Register {
                unit,
                register,
                value,
            } => {
                trace!(unit, register, value = %format!("{:#010x}", value), "Register response");
                return Outcome::Discarded(Discard::RegisterResponse);
            }
        };

        let Some(active) = self.jobs.snapshot(result.handle) else {
            debug!(handle = result.handle, nonce = %format!("{:#010x}", result.nonce), "Result for stale job");
            return Outcome::Discarded(Discard::StaleJob(result.handle));
        };

        let base_version = active.job.version_bits();
        let rolled_version = result.rolled_version(base_version);
        let difficulty = self.evaluator.evaluate(&active, result.nonce, rolled_version);

        let submitted = difficulty > active.pool_difficulty;
        if submitted {
            let version_bits = (active.job.version_mask != 0).then_some(rolled_version ^ base_version);
            let share = Share {
                job_id: active.job.job_id.clone(),
                extranonce2: active.extranonce2,
                ntime: active.job.ntime,
                nonce: result.nonce,
                version_bits,
            };
            info!(
                job_id = %share.job_id,
                nonce = %format!("{:#010x}", result.nonce),
                difficulty = %format!("{:.1}", difficulty),
                pool_difficulty = active.pool_difficulty,
                "Share found"
            );
            if self
                .submit_tx
                .send(ClientCommand::SubmitShare(share))
                .await
                .is_err()
            {
                warn!("Stratum client gone, share dropped");
            }
        }

        let nonce_found = difficulty > self.asic_difficulty;
        if nonce_found {
            self.emit(PipelineEvent::NonceFound {
                unit: result.unit,
                threshold: self.asic_difficulty,
                achieved: difficulty,
            });
        }

        let new_best = self.best.observe(difficulty);
        if new_best {
            self.emit(PipelineEvent::BestDifficulty {
                difficulty,
                handle: result.handle,
            });
        }

        Outcome::Evaluated(Verdict {
            handle: result.handle,
            difficulty,
            submitted,
            nonce_found,
            new_best,
        })
    }

    fn emit(&self, event: PipelineEvent) {
        // Telemetry must never hold up result processing
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "Pipeline event dropped");
        }
    }

    /// Consume responses until shutdown or until the board hangs up.
    pub async fn run(self, mut results: mpsc::Receiver<ChipResponse>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                response = results.recv() => {
                    let Some(response) = response else {
                        debug!("Result channel closed");
                        break;
                    };
                    self.process(response).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
