//! Classification of inbound pool lines.
//!
//! Every line from the pool becomes exactly one [`ProtocolMessage`] or a
//! [`ParseError`]. Parsing has no side effects: session state is only
//! touched by the client after classification, and a message with any bad
//! field is rejected whole.
//!
//! Responses carry no method name, so they are matched against the session's
//! [`PendingRequests`] to learn what they answer. Responses to ids we never
//! issued (or issued on a previous connection) classify as
//! [`ProtocolMessage::Unknown`].

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use super::messages::{MiningJob, parse_hex_u32};

/// Fixed id of `mining.subscribe`.
pub const SUBSCRIBE_ID: u64 = 1;

/// Fixed id of `mining.configure`.
pub const CONFIGURE_ID: u64 = 2;

/// First id handed out by the per-session request counter.
pub const FIRST_COUNTER_ID: u64 = 3;

/// Malformed pool message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Not JSON: {0}")]
    Json(String),

    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("{method}: expected at least {expected} params, got {got}")]
    ParamCount {
        method: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ParseError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ParseError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// What an outstanding request id was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Configure,
    Authorize,
    SuggestDifficulty,
    Submit { job_id: String, nonce: u32 },
}

/// Requests awaiting a response, keyed by id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<u64, RequestKind>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, kind: RequestKind) {
        self.entries.insert(id, kind);
    }

    pub fn get(&self, id: u64) -> Option<&RequestKind> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<RequestKind> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Data carried by a response, shaped by the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    /// Successful `mining.subscribe`
    Subscribe {
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
        /// Subscription id the pool may honour when we reconnect
        session_id: Option<String>,
    },

    /// `mining.configure`; `None` when the pool declined version rolling
    Configure { version_mask: Option<u32> },

    /// Plain acknowledgement (or an error for any request kind)
    Ack {
        request: RequestKind,
        error: Option<String>,
    },
}

/// One classified pool message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Notify { job: MiningJob, clean_jobs: bool },
    SetDifficulty(f64),
    SetVersionMask(u32),
    Reconnect {
        host: Option<String>,
        port: Option<u16>,
    },
    Result {
        id: u64,
        success: bool,
        payload: ResultPayload,
    },
    Unknown,
}

/// Classify one line from the pool.
pub fn parse(line: &str, pending: &PendingRequests) -> Result<ProtocolMessage, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ParseError::Json(e.to_string()))?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = match obj.get("params") {
            Some(Value::Array(params)) => params.as_slice(),
            _ => &[],
        };
        return parse_method(method, params);
    }

    let Some(id) = obj.get("id").and_then(Value::as_u64) else {
        return Ok(ProtocolMessage::Unknown);
    };
    let Some(kind) = pending.get(id) else {
        return Ok(ProtocolMessage::Unknown);
    };

    let result = obj.get("result").unwrap_or(&Value::Null);
    let error = obj
        .get("error")
        .filter(|e| !e.is_null())
        .map(describe_error);

    parse_result(id, kind, result, error)
}

fn parse_method(method: &str, params: &[Value]) -> Result<ProtocolMessage, ParseError> {
    match method {
        "mining.notify" => {
            let (job, clean_jobs) = MiningJob::from_stratum_params(params)?;
            Ok(ProtocolMessage::Notify { job, clean_jobs })
        }
        "mining.set_difficulty" => {
            let difficulty = params
                .first()
                .and_then(Value::as_f64)
                .ok_or(ParseError::ParamCount {
                    method: "mining.set_difficulty",
                    expected: 1,
                    got: params.len(),
                })?;
            if !difficulty.is_finite() || difficulty <= 0.0 {
                return Err(ParseError::invalid(
                    "difficulty",
                    format!("{} is not a positive number", difficulty),
                ));
            }
            Ok(ProtocolMessage::SetDifficulty(difficulty))
        }
        "mining.set_version_mask" => {
            let mask = params
                .first()
                .and_then(Value::as_str)
                .and_then(parse_hex_u32)
                .ok_or_else(|| ParseError::invalid("version_mask", "expected a hex word"))?;
            Ok(ProtocolMessage::SetVersionMask(mask))
        }
        "client.reconnect" => {
            let host = params
                .first()
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_string);
            let port = params.get(1).and_then(|p| match p {
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(s) => s.parse().ok(),
                _ => None,
            });
            Ok(ProtocolMessage::Reconnect { host, port })
        }
        _ => Ok(ProtocolMessage::Unknown),
    }
}

fn parse_result(
    id: u64,
    kind: &RequestKind,
    result: &Value,
    error: Option<String>,
) -> Result<ProtocolMessage, ParseError> {
    let ack = |success: bool, error: Option<String>| ProtocolMessage::Result {
        id,
        success,
        payload: ResultPayload::Ack {
            request: kind.clone(),
            error,
        },
    };

    if error.is_some() {
        return Ok(match kind {
            RequestKind::Configure => ProtocolMessage::Result {
                id,
                success: false,
                payload: ResultPayload::Configure { version_mask: None },
            },
            _ => ack(false, error),
        });
    }

    match kind {
        RequestKind::Subscribe => {
            if result.is_null() || result.as_bool() == Some(false) {
                return Ok(ack(false, Some("subscribe returned no result".to_string())));
            }
            parse_subscribe_result(id, result)
        }
        RequestKind::Configure => {
            let version_mask = parse_configure_result(result)?;
            Ok(ProtocolMessage::Result {
                id,
                success: version_mask.is_some(),
                payload: ResultPayload::Configure { version_mask },
            })
        }
        _ => {
            let success = result.as_bool().unwrap_or(!result.is_null());
            let error = (!success).then(|| "pool returned false".to_string());
            Ok(ack(success, error))
        }
    }
}

/// Subscribe result: `[[subscriptions...], extranonce1_hex, extranonce2_size]`.
fn parse_subscribe_result(id: u64, result: &Value) -> Result<ProtocolMessage, ParseError> {
    let arr = result
        .as_array()
        .ok_or_else(|| ParseError::invalid("subscribe result", "not an array"))?;
    if arr.len() < 3 {
        return Err(ParseError::invalid(
            "subscribe result",
            format!("{} elements", arr.len()),
        ));
    }

    let extranonce1 = arr[1]
        .as_str()
        .and_then(|s| hex::decode(s).ok())
        .ok_or_else(|| ParseError::invalid("extranonce1", "expected hex string"))?;

    let extranonce2_size = arr[2]
        .as_u64()
        .filter(|size| (1..=8).contains(size))
        .ok_or_else(|| ParseError::invalid("extranonce2_size", format!("{}", arr[2])))?
        as usize;

    Ok(ProtocolMessage::Result {
        id,
        success: true,
        payload: ResultPayload::Subscribe {
            extranonce1,
            extranonce2_size,
            session_id: subscription_id(&arr[0]),
        },
    })
}

/// Find the `mining.notify` subscription id in the subscription details.
fn subscription_id(details: &Value) -> Option<String> {
    details.as_array()?.iter().find_map(|entry| {
        let pair = entry.as_array()?;
        match (pair.first()?.as_str()?, pair.get(1)?.as_str()?) {
            ("mining.notify", id) if !id.is_empty() => Some(id.to_string()),
            _ => None,
        }
    })
}

/// Configure result: `{"version-rolling": bool, "version-rolling.mask": hex}`.
fn parse_configure_result(result: &Value) -> Result<Option<u32>, ParseError> {
    let Some(obj) = result.as_object() else {
        return Ok(None);
    };
    if obj.get("version-rolling").and_then(Value::as_bool) != Some(true) {
        return Ok(None);
    }
    let mask = obj
        .get("version-rolling.mask")
        .and_then(Value::as_str)
        .and_then(parse_hex_u32)
        .ok_or_else(|| ParseError::invalid("version-rolling.mask", "expected a hex word"))?;
    Ok(Some(mask))
}

fn describe_error(error: &Value) -> String {
    // Pools send either [code, "message", data] or {"code", "message"}
    match error {
        Value::Array(parts) => match (parts.first(), parts.get(1).and_then(Value::as_str)) {
            (Some(code), Some(msg)) => format!("{} (code {})", msg, code),
            _ => error.to_string(),
        },
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
