//! Stratum v1 mining client core.
//!
//! Connects to a pool, turns pool work into jobs for a hash board, and
//! checks every nonce the board reports before submitting it as a share.

pub mod board;
pub mod config;
pub mod daemon;
pub mod evaluator;
pub mod job_table;
pub mod pipeline;
pub mod stratum_v1;
pub mod tracing;
pub mod types;
