//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Inbound traffic is classified by [`super::parser`]; this module holds the
//! typed payloads it produces and the envelope for our outbound requests.

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::Serialize;
use serde_json::Value;

use super::parser::ParseError;
use crate::types::Extranonce2;

/// Most merkle branches a notify may carry.
pub const MAX_MERKLE_BRANCHES: usize = 32;

/// Longest job id we accept from a pool.
pub const MAX_JOB_ID_LEN: usize = 64;

/// Commands sent to the Stratum client by the rest of the miner.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Submit a share to the pool
    SubmitShare(Share),

    /// Suggest a new difficulty to the pool
    SuggestDifficulty(f64),
}

/// A share found by hardware, ready for submission.
///
/// The client fills in the worker name when it builds [`SubmitParams`].
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub job_id: String,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,

    /// Rolled bits relative to the job's base version, when rolling is active
    pub version_bits: Option<u32>,
}

/// Mining job from the pool (mining.notify).
///
/// This is the core work unit sent by the pool. It contains all the data
/// needed to construct block headers for mining.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningJob {
    /// Pool's job identifier, echoed back on submit
    pub job_id: String,

    /// Previous block hash
    pub prev_hash: BlockHash,

    /// First part of coinbase transaction (before extranonce)
    pub coinbase1: Vec<u8>,

    /// Second part of coinbase transaction (after extranonce)
    pub coinbase2: Vec<u8>,

    /// Merkle branch hashes for computing merkle root
    pub merkle_branches: Vec<TxMerkleNode>,

    /// Block version field
    pub version: Version,

    /// Encoded network target (nbits)
    pub nbits: CompactTarget,

    /// Block timestamp (Unix epoch seconds)
    pub ntime: u32,

    /// Version bits hardware may roll; zero until the session grants a mask
    pub version_mask: u32,
}

impl MiningJob {
    /// Parse from Stratum JSON array parameters.
    ///
    /// Returns the job and its clean_jobs flag. Any malformed field rejects
    /// the whole notify.
    pub fn from_stratum_params(params: &[Value]) -> Result<(Self, bool), ParseError> {
        if params.len() < 9 {
            return Err(ParseError::ParamCount {
                method: "mining.notify",
                expected: 9,
                got: params.len(),
            });
        }

        let job_id = str_field(&params[0], "job_id")?;
        if job_id.is_empty() || job_id.len() > MAX_JOB_ID_LEN {
            return Err(ParseError::invalid("job_id", format!("length {}", job_id.len())));
        }

        let prev_hash = parse_block_hash(str_field(&params[1], "prev_hash")?)?;
        let coinbase1 = hex_field(&params[2], "coinbase1")?;
        let coinbase2 = hex_field(&params[3], "coinbase2")?;

        let branches_json = params[4]
            .as_array()
            .ok_or_else(|| ParseError::invalid("merkle_branches", "not an array"))?;
        if branches_json.len() > MAX_MERKLE_BRANCHES {
            return Err(ParseError::invalid(
                "merkle_branches",
                format!("{} branches exceeds {}", branches_json.len(), MAX_MERKLE_BRANCHES),
            ));
        }
        let merkle_branches = branches_json
            .iter()
            .map(|branch| parse_merkle_node(str_field(branch, "merkle_branch")?))
            .collect::<Result<Vec<_>, _>>()?;

        // Version, nbits and ntime are big-endian hex words
        let version = Version::from_consensus(u32_hex_field(&params[5], "version")? as i32);
        let nbits = CompactTarget::from_consensus(u32_hex_field(&params[6], "nbits")?);
        let ntime = u32_hex_field(&params[7], "ntime")?;

        let clean_jobs = params[8]
            .as_bool()
            .ok_or_else(|| ParseError::invalid("clean_jobs", "not a bool"))?;

        let job = Self {
            job_id: job_id.to_string(),
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            version_mask: 0,
        };
        Ok((job, clean_jobs))
    }

    /// Base version as the raw header word.
    pub fn version_bits(&self) -> u32 {
        self.version.to_consensus() as u32
    }
}

fn str_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ParseError> {
    value
        .as_str()
        .ok_or_else(|| ParseError::invalid(field, "not a string"))
}

fn hex_field(value: &Value, field: &'static str) -> Result<Vec<u8>, ParseError> {
    hex::decode(str_field(value, field)?).map_err(|e| ParseError::invalid(field, e.to_string()))
}

/// Parse a big-endian 32-bit hex word, tolerating a `0x` prefix.
pub(crate) fn parse_hex_u32(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

fn u32_hex_field(value: &Value, field: &'static str) -> Result<u32, ParseError> {
    let s = str_field(value, field)?;
    parse_hex_u32(s).ok_or_else(|| ParseError::invalid(field, format!("bad hex word {:?}", s)))
}

/// Parse a block hash from Stratum hex string.
///
/// Stratum v1 sends the previous block hash as eight 4-byte words, each
/// transmitted with its bytes reversed relative to the internal byte order.
/// Reversing the bytes within every word yields the internal representation:
///
/// ```text
/// Stratum:  "6b6455fd 6db962c1 01f2d4fc 0d67f4a3 bc96391d 00015296 00000000 00000000"
/// Internal: [fd 55 64 6b] [c1 62 b9 6d] [fc d4 f2 01] [a3 f4 67 0d] ...
/// Display:  000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd
/// ```
pub(crate) fn parse_block_hash(hex: &str) -> Result<BlockHash, ParseError> {
    let mut bytes =
        hex::decode(hex).map_err(|e| ParseError::invalid("prev_hash", e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ParseError::invalid(
            "prev_hash",
            format!("wrong length: {}", bytes.len()),
        ));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| ParseError::invalid("prev_hash", e.to_string()))
}

/// Parse a merkle node from Stratum hex string (internal byte order).
fn parse_merkle_node(hex: &str) -> Result<TxMerkleNode, ParseError> {
    let bytes =
        hex::decode(hex).map_err(|e| ParseError::invalid("merkle_branch", e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ParseError::invalid(
            "merkle_branch",
            format!("wrong length: {}", bytes.len()),
        ));
    }
    TxMerkleNode::from_slice(&bytes)
        .map_err(|e| ParseError::invalid("merkle_branch", e.to_string()))
}

/// Parameters for submitting a share to the pool.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    /// Worker username
    pub username: String,

    pub job_id: String,

    pub extranonce2: Extranonce2,

    /// Timestamp used (Unix epoch seconds)
    pub ntime: u32,

    pub nonce: u32,

    /// Version bits used (only when version rolling is active)
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    pub fn new(username: &str, share: Share) -> Self {
        Self {
            username: username.to_string(),
            job_id: share.job_id,
            extranonce2: share.extranonce2,
            ntime: share.ntime,
            nonce: share.nonce,
            version_bits: share.version_bits,
        }
    }

    /// Convert to the positional hex parameters of `mining.submit`.
    pub fn to_stratum_json(&self) -> Vec<Value> {
        let mut params = vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(self.extranonce2.to_string()),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ];

        if let Some(version_bits) = self.version_bits {
            params.push(Value::String(format!("{:08x}", version_bits)));
        }

        params
    }
}

/// Outbound JSON-RPC request.
///
/// Stratum predates JSON-RPC 2.0: there is no version field and
/// notifications carry `id: null`. We only ever originate requests, so the
/// envelope is a plain struct.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}
