//! Hash boards: where jobs are hashed and nonces come back from.
//!
//! A board consumes [`Work`] and reports [`ChipResponse`]s. Chips answer
//! with either a nonce candidate tagged by job handle, or a register
//! readout on the same channel; only the former is mining output.

mod cpu;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job_table::{ActiveJob, JobHandle};

pub use cpu::CpuBoard;

/// Board errors.
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Result channel closed")]
    ChannelClosed,
}

/// Board description for logging.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    pub model: String,
    pub hash_units: usize,
}

/// One job dispatched to a board.
#[derive(Debug, Clone)]
pub struct Work {
    pub handle: JobHandle,
    pub job: ActiveJob,

    /// Earlier work is void. The CPU board abandons its scan for every new
    /// item regardless; boards that queue work flush the queue on this.
    pub clean_jobs: bool,
}

/// A nonce candidate reported by a hash unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceResult {
    pub handle: JobHandle,
    pub nonce: u32,

    /// Version bits the unit rolled, to be OR-ed into the job's base version
    pub version_bits: u32,

    /// Chip or core index that found it
    pub unit: u8,
}

impl NonceResult {
    /// Version the unit actually hashed.
    pub fn rolled_version(&self, base_version: u32) -> u32 {
        self.version_bits | base_version
    }
}

/// Anything a hash unit can send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipResponse {
    Nonce(NonceResult),
    Register { unit: u8, register: u8, value: u32 },
}

#[async_trait]
pub trait HashBoard: Send {
    fn board_info(&self) -> BoardInfo;

    /// Hash incoming work until shutdown or until the work channel closes.
    async fn run(
        &mut self,
        work_rx: mpsc::Receiver<Work>,
        results: mpsc::Sender<ChipResponse>,
        shutdown: CancellationToken,
    ) -> Result<(), BoardError>;
}
