//! Daemon lifecycle management for stratum-miner.
//!
//! This module wires the miner together, handles signals, and shuts
//! everything down gracefully:
//!
//! ```text
//! pool <-> StratumV1Client --Work--> board --ChipResponse--> ResultPipeline
//!               ^                                                  |
//!               +------------------ ClientCommand -----------------+
//! ```

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::board::{ChipResponse, CpuBoard, HashBoard, Work};
use crate::config::MinerConfig;
use crate::evaluator::HeaderEvaluator;
use crate::job_table::JobTable;
use crate::pipeline::{PipelineEvent, ResultPipeline};
use crate::stratum_v1::{ClientCommand, StratumV1Client};
use crate::tracing::prelude::*;

const WORK_CHANNEL_SIZE: usize = 16;
const RESULT_CHANNEL_SIZE: usize = 256;
const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 64;

/// The main daemon that coordinates all mining operations.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let jobs = Arc::new(JobTable::new(self.config.job_slots));

        let (work_tx, work_rx) = mpsc::channel::<Work>(WORK_CHANNEL_SIZE);
        let (result_tx, result_rx) = mpsc::channel::<ChipResponse>(RESULT_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel::<ClientCommand>(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);

        match configured_board(&self.config) {
            Some(mut board) => {
                let info = board.board_info();
                info!(model = %info.model, hash_units = info.hash_units, "Board ready");
                self.tracker.spawn({
                    let shutdown = self.shutdown.clone();
                    async move {
                        if let Err(e) = board.run(work_rx, result_tx, shutdown).await {
                            error!("Board stopped: {}", e);
                        }
                    }
                });
            }
            None => {
                // Jobs are still tracked; nothing hashes them
                info!("No hash board configured, set MINER_CPU_THREADS to hash on the CPU");
                drop(work_rx);
                drop(result_tx);
            }
        }

        let pipeline = ResultPipeline::new(
            jobs.clone(),
            Arc::new(HeaderEvaluator),
            command_tx,
            event_tx,
            self.config.asic_difficulty,
        );
        self.tracker.spawn(pipeline.run(result_rx, self.shutdown.clone()));
        self.tracker.spawn(log_events(event_rx, self.shutdown.clone()));

        let client = StratumV1Client::new(
            self.config.pool.clone(),
            jobs,
            work_tx,
            command_rx,
            self.shutdown.clone(),
        );
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = client.run().await {
                    error!("Stratum client stopped: {}", e);
                    shutdown.cancel();
                }
            }
        });
        self.tracker.close();

        info!(pool = %self.config.pool.url, user = %self.config.pool.username, "Started.");
        info!("For protocol debugging, set RUST_LOG=stratum_miner=trace to see every pool line");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
            _ = self.shutdown.cancelled() => {
                warn!("Shutting down after fatal error");
            },
        }

        // Initiate shutdown
        trace!("Shutting down.");
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// The CPU board, if `MINER_CPU_THREADS` asked for one.
fn configured_board(config: &MinerConfig) -> Option<CpuBoard> {
    config.cpu_threads.map(CpuBoard::new)
}

/// Log pipeline events until shutdown.
async fn log_events(mut events: mpsc::Receiver<PipelineEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PipelineEvent::NonceFound { unit, threshold, achieved }) => {
                    debug!(unit, threshold, achieved = %format!("{:.1}", achieved), "Nonce found");
                }
                Some(PipelineEvent::BestDifficulty { difficulty, handle }) => {
                    info!(handle, difficulty = %format!("{:.1}", difficulty), "New best difficulty");
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}
