//! CPU hash board.
//!
//! Scans the nonce space on blocking threads so the miner can run against a
//! pool without hardware. Each new job abandons the previous scan. Threads
//! interleave nonces (thread `i` tries `i`, `i + n`, `i + 2n`, ...) and
//! report any nonce whose hash meets the job's pool difficulty.
//!
//! This is slow: a few MH/s per thread at best. It exists for testing and
//! development, not for profit.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BoardError, BoardInfo, ChipResponse, HashBoard, NonceResult, Work};
use crate::evaluator::HeaderEvaluator;
use crate::tracing::prelude::*;

/// Nonces between cancellation checks.
const CANCEL_CHECK_INTERVAL: u32 = 4096;

pub struct CpuBoard {
    threads: usize,
}

impl CpuBoard {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.clamp(1, u8::MAX as usize),
        }
    }
}

#[async_trait]
impl HashBoard for CpuBoard {
    fn board_info(&self) -> BoardInfo {
        BoardInfo {
            model: "CPU".into(),
            hash_units: self.threads,
        }
    }

    async fn run(
        &mut self,
        mut work_rx: mpsc::Receiver<Work>,
        results: mpsc::Sender<ChipResponse>,
        shutdown: CancellationToken,
    ) -> Result<(), BoardError> {
        let mut current: Option<CancellationToken> = None;

        loop {
            tokio::select! {
                work = work_rx.recv() => {
                    let Some(work) = work else {
                        debug!("Work channel closed");
                        break;
                    };
                    if let Some(scan) = current.take() {
                        scan.cancel();
                    }
                    if results.is_closed() {
                        return Err(BoardError::ChannelClosed);
                    }

                    debug!(
                        handle = work.handle,
                        job_id = %work.job.job.job_id,
                        extranonce2 = %work.job.extranonce2,
                        clean_jobs = work.clean_jobs,
                        "Starting CPU scan"
                    );

                    let scan = shutdown.child_token();
                    for unit in 0..self.threads {
                        let work = work.clone();
                        let scan = scan.clone();
                        let results = results.clone();
                        let stride = self.threads as u32;
                        tokio::task::spawn_blocking(move || {
                            scan_nonces(work, unit as u8, unit as u32, stride, scan, results)
                        });
                    }
                    current = Some(scan);
                }
                _ = shutdown.cancelled() => break,
            }
        }

        if let Some(scan) = current {
            scan.cancel();
        }
        Ok(())
    }
}

fn scan_nonces(
    work: Work,
    unit: u8,
    start: u32,
    stride: u32,
    cancel: CancellationToken,
    results: mpsc::Sender<ChipResponse>,
) {
    let root = HeaderEvaluator::merkle_root(&work.job);
    let version = work.job.job.version_bits();
    let threshold = work.job.pool_difficulty;
    let mut nonce = start;
    let mut since_check = 0u32;

    loop {
        let hash = HeaderEvaluator::header(&work.job, root, nonce, version).block_hash();
        if HeaderEvaluator::hash_difficulty(&hash) >= threshold {
            let response = ChipResponse::Nonce(NonceResult {
                handle: work.handle,
                nonce,
                version_bits: 0,
                unit,
            });
            if results.blocking_send(response).is_err() {
                return;
            }
        }

        since_check += 1;
        if since_check == CANCEL_CHECK_INTERVAL {
            since_check = 0;
            if cancel.is_cancelled() {
                return;
            }
        }

        let (next, wrapped) = nonce.overflowing_add(stride);
        if wrapped {
            debug!(unit, handle = work.handle, "Nonce space exhausted");
            return;
        }
        nonce = next;
    }
}
