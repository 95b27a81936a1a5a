//! Per-connection protocol state.
//!
//! A [`Session`] is created when a TCP connection comes up and dropped when
//! it goes away, so nothing learned from one connection (extranonce grant,
//! difficulty, version mask, outstanding request ids) can leak into the next.

use super::parser::{CONFIGURE_ID, FIRST_COUNTER_ID, PendingRequests, RequestKind, SUBSCRIBE_ID};
use crate::tracing::prelude::*;
use crate::types::{Extranonce2, Extranonce2Error};

/// Difficulty assumed until the pool sends `mining.set_difficulty`.
pub const DEFAULT_POOL_DIFFICULTY: f64 = 1.0;

/// Session lifecycle.
///
/// `Disconnected` and `Reconnecting` describe the client between sessions;
/// a live [`Session`] starts at `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Disconnected,
    Reconnecting,
    Connected,
    Subscribed,
    Configured,
    Authorized,
    Mining,
}

/// Extranonce parameters granted by `mining.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtranonceGrant {
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

/// Share accounting for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    grant: Option<ExtranonceGrant>,
    extranonce2: Option<Extranonce2>,
    authorized: bool,
    difficulty: f64,
    version_mask: Option<u32>,
    next_id: u64,
    pending: PendingRequests,
    stats: SessionStats,
    reached_mining: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Connected,
            grant: None,
            extranonce2: None,
            authorized: false,
            difficulty: DEFAULT_POOL_DIFFICULTY,
            version_mask: None,
            next_id: FIRST_COUNTER_ID,
            pending: PendingRequests::new(),
            stats: SessionStats::default(),
            reached_mining: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether this session ever received work after authorizing.
    pub fn reached_mining(&self) -> bool {
        self.reached_mining
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Allocate an id for a request and remember what it was for.
    ///
    /// Subscribe and configure use fixed ids; everything else draws from the
    /// counter.
    pub fn track(&mut self, kind: RequestKind) -> u64 {
        let id = match kind {
            RequestKind::Subscribe => SUBSCRIBE_ID,
            RequestKind::Configure => CONFIGURE_ID,
            _ => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        if matches!(kind, RequestKind::Submit { .. }) {
            self.stats.submitted += 1;
        }
        self.pending.insert(id, kind);
        id
    }

    /// Forget a request once its response has been handled.
    pub fn complete(&mut self, id: u64) -> Option<RequestKind> {
        self.pending.remove(id)
    }

    pub fn grant(&self) -> Option<&ExtranonceGrant> {
        self.grant.as_ref()
    }

    /// Record the subscribe grant.
    ///
    /// Configure and authorize acks may already have arrived (configure is
    /// written first), so the phase jumps straight to the furthest one
    /// they allow.
    pub fn on_subscribed(&mut self, grant: ExtranonceGrant) -> Result<(), Extranonce2Error> {
        self.extranonce2 = Some(Extranonce2::new(grant.extranonce2_size)?);
        self.grant = Some(grant);
        if self.phase < SessionPhase::Subscribed {
            self.phase = if self.authorized {
                SessionPhase::Authorized
            } else if self.version_mask.is_some() {
                SessionPhase::Configured
            } else {
                SessionPhase::Subscribed
            };
        }
        Ok(())
    }

    /// Record the configure outcome. `None` means rolling is off.
    ///
    /// Before the subscribe ack only the mask is kept; the phase follows
    /// in [`Session::on_subscribed`].
    pub fn on_configured(&mut self, version_mask: Option<u32>) {
        self.version_mask = version_mask;
        if version_mask.is_some() && self.phase == SessionPhase::Subscribed {
            self.phase = SessionPhase::Configured;
        }
    }

    pub fn on_authorized(&mut self) {
        self.authorized = true;
        if matches!(
            self.phase,
            SessionPhase::Subscribed | SessionPhase::Configured
        ) {
            self.phase = SessionPhase::Authorized;
        }
    }

    /// Note that a job was dispatched.
    pub fn on_job(&mut self) {
        if self.phase == SessionPhase::Authorized {
            self.phase = SessionPhase::Mining;
            self.reached_mining = true;
        }
    }

    /// Next extranonce2 value for a fresh job.
    ///
    /// Returns `None` before the pool has granted an extranonce. After the
    /// last value the counter starts again at zero, reissuing coinbases
    /// that were already handed out.
    pub fn next_extranonce2(&mut self) -> Option<Extranonce2> {
        let current = self.extranonce2.as_mut()?;
        let value = *current;
        if !current.increment() {
            warn!(
                size = value.size(),
                "Extranonce2 space exhausted, wrapping to zero"
            );
        }
        Some(value)
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn set_difficulty(&mut self, difficulty: f64) {
        self.difficulty = difficulty;
    }

    pub fn version_mask(&self) -> Option<u32> {
        self.version_mask
    }

    /// Pool-pushed mask (`mining.set_version_mask`).
    pub fn set_version_mask(&mut self, mask: u32) {
        self.version_mask = Some(mask);
    }

    pub fn record_share_result(&mut self, accepted: bool) {
        if accepted {
            self.stats.accepted += 1;
        } else {
            self.stats.rejected += 1;
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
