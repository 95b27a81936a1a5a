//! Miner configuration.
//!
//! Everything is read from environment variables at startup. Invalid values
//! are reported before any connection is attempted.
//!
//! # Environment Variables
//!
//! - `MINER_POOL_URL`: pool address, `stratum+tcp://host:port` (required)
//! - `MINER_POOL_USER`: worker name (default: `stratum-miner`)
//! - `MINER_POOL_PASS`: worker password (default: `x`)
//! - `MINER_USER_AGENT`: sent with `mining.subscribe`
//! - `MINER_SUGGEST_DIFFICULTY`: difficulty to suggest after authorizing
//! - `MINER_VERSION_ROLLING`: `0`/`false`/`off` disables version rolling
//! - `MINER_ASIC_DIFFICULTY`: local difficulty for nonce-found events (default: 256)
//! - `MINER_JOB_SLOTS`: job table capacity, 1-256 (default: 128)
//! - `MINER_MAX_LINE`: longest accepted pool line in bytes (default: 65536)
//! - `MINER_CPU_THREADS`: hash on the CPU with this many threads

use std::str::FromStr;

use thiserror::Error;

use crate::job_table::{DEFAULT_SLOTS, MAX_SLOTS};
use crate::stratum_v1::{DEFAULT_MAX_LINE_LENGTH, PoolConfig, host_port};

pub const DEFAULT_ASIC_DIFFICULTY: f64 = 256.0;

/// Smallest line bound that still fits a realistic notify.
const MIN_LINE_LENGTH: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub pool: PoolConfig,

    /// Local per-unit difficulty for nonce-found events
    pub asic_difficulty: f64,

    pub job_slots: usize,

    /// CPU hashing threads, if the CPU board is wanted
    pub cpu_threads: Option<usize>,
}

impl MinerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("MINER_POOL_URL").ok_or(ConfigError::Missing {
            name: "MINER_POOL_URL",
        })?;
        if let Err(e) = host_port(&url) {
            return Err(invalid("MINER_POOL_URL", &url, e.to_string()));
        }

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            url,
            username: lookup("MINER_POOL_USER").unwrap_or_else(|| "stratum-miner".to_string()),
            password: lookup("MINER_POOL_PASS").unwrap_or_else(|| "x".to_string()),
            user_agent: lookup("MINER_USER_AGENT").unwrap_or(defaults.user_agent),
            suggest_difficulty: parse_var(&lookup, "MINER_SUGGEST_DIFFICULTY")?
                .map(|d| positive("MINER_SUGGEST_DIFFICULTY", d))
                .transpose()?,
            version_rolling: match lookup("MINER_VERSION_ROLLING") {
                Some(value) => parse_switch("MINER_VERSION_ROLLING", &value)?,
                None => defaults.version_rolling,
            },
            max_line_length: parse_var(&lookup, "MINER_MAX_LINE")?
                .map(|n| at_least("MINER_MAX_LINE", n, MIN_LINE_LENGTH))
                .transpose()?
                .unwrap_or(DEFAULT_MAX_LINE_LENGTH),
        };

        let asic_difficulty = parse_var(&lookup, "MINER_ASIC_DIFFICULTY")?
            .map(|d| positive("MINER_ASIC_DIFFICULTY", d))
            .transpose()?
            .unwrap_or(DEFAULT_ASIC_DIFFICULTY);

        let job_slots = parse_var::<usize>(&lookup, "MINER_JOB_SLOTS")?.unwrap_or(DEFAULT_SLOTS);
        if !(1..=MAX_SLOTS).contains(&job_slots) {
            return Err(invalid(
                "MINER_JOB_SLOTS",
                &job_slots.to_string(),
                format!("must be 1-{}", MAX_SLOTS),
            ));
        }

        let cpu_threads = parse_var::<usize>(&lookup, "MINER_CPU_THREADS")?;
        if let Some(threads) = cpu_threads {
            if !(1..=u8::MAX as usize).contains(&threads) {
                return Err(invalid(
                    "MINER_CPU_THREADS",
                    &threads.to_string(),
                    "must be 1-255".to_string(),
                ));
            }
        }

        Ok(Self {
            pool,
            asic_difficulty,
            job_slots,
            cpu_threads,
        })
    }
}

fn invalid(name: &'static str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason,
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e: T::Err| invalid(name, &value, e.to_string()))
        })
        .transpose()
}

fn parse_switch(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(invalid(name, value, "expected on/off".to_string())),
    }
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(invalid(name, &value.to_string(), "must be positive".to_string()))
    }
}

fn at_least(name: &'static str, value: usize, min: usize) -> Result<usize, ConfigError> {
    if value >= min {
        Ok(value)
    } else {
        Err(invalid(name, &value.to_string(), format!("must be at least {}", min)))
    }
}
