//! Stratum v1 mining protocol client.
//!
//! Stratum v1 is JSON-RPC over TCP, one JSON object per line. The pieces:
//!
//! - [`codec`]: splits the byte stream into bounded lines
//! - [`connection`]: the [`Transport`] seam and its TCP implementation
//! - [`parser`]: classifies a line into a [`ProtocolMessage`]
//! - [`session`]: per-connection state (extranonce grant, difficulty,
//!   version mask, pending requests)
//! - [`client`]: drives the handshake and the mining loop, reconnecting
//!   until shutdown
//!
//! # Protocol Overview
//!
//! - **Client requests**: `mining.configure`, `mining.subscribe`,
//!   `mining.authorize`, `mining.suggest_difficulty`, `mining.submit`
//! - **Server notifications**: `mining.notify`, `mining.set_difficulty`,
//!   `mining.set_version_mask`, `client.reconnect`
//! - **Server responses**: results for client requests, matched by id
//!
//! # Usage
//!
//! ```rust,ignore
//! let jobs = Arc::new(JobTable::new(DEFAULT_SLOTS));
//! let (work_tx, work_rx) = mpsc::channel(16);
//! let (command_tx, command_rx) = mpsc::channel(64);
//!
//! let client = StratumV1Client::new(config, jobs, work_tx, command_rx, shutdown);
//! tokio::spawn(client.run());
//!
//! // Hand work_rx to a board, and command_tx to the result pipeline.
//! ```

pub mod client;
pub mod codec;
pub mod connection;
mod error;
pub mod messages;
pub mod parser;
pub mod session;

pub use client::{Backoff, PoolConfig, StratumV1Client};
pub use codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec};
pub use connection::{Connection, Transport, host_port};
pub use error::{StratumError, StratumResult};
pub use messages::{ClientCommand, JsonRpcRequest, MiningJob, Share, SubmitParams};
pub use parser::{ParseError, PendingRequests, ProtocolMessage, RequestKind, ResultPayload, parse};
pub use session::{Session, SessionPhase, SessionStats};
