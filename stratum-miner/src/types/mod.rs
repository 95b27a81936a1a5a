//! Core value types shared across the miner.

mod extranonce2;

pub use extranonce2::{Extranonce2, Extranonce2Error};
