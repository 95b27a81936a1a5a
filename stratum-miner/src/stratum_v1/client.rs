//! Stratum v1 client implementation.
//!
//! The client owns the connection lifecycle: it connects, writes the
//! handshake, classifies every inbound line with the parser, turns each
//! `mining.notify` into a job in the [`JobTable`] plus a [`Work`] item for
//! the board, and writes share submissions handed to it by the result
//! pipeline.
//!
//! Requests are fire-and-forget. Responses are matched to requests later via
//! the session's pending table, so notifications interleaved with responses
//! need no special handling.
//!
//! When a session ends for any reason other than shutdown, every job in the
//! table is invalidated, a fresh [`Session`] is created, and the client
//! reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::codec::DEFAULT_MAX_LINE_LENGTH;
use super::connection::{Connection, Transport};
use super::error::{StratumError, StratumResult};
use super::messages::{ClientCommand, JsonRpcRequest, MiningJob, SubmitParams};
use super::parser::{self, ProtocolMessage, RequestKind, ResultPayload};
use super::session::{ExtranonceGrant, Session, SessionPhase};
use crate::board::Work;
use crate::job_table::{ActiveJob, HandleAllocator, JobTable};
use crate::tracing::prelude::*;

/// General-purpose version bits requested from the pool (bits 13-28).
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Fewest rollable bits we can work with.
pub const VERSION_ROLLING_MIN_BITS: u32 = 2;

/// Time allowed from connect to an authorized, subscribed session.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// User agent string
    pub user_agent: String,

    /// Difficulty to suggest after authorizing
    pub suggest_difficulty: Option<f64>,

    /// Whether to negotiate version rolling with `mining.configure`
    pub version_rolling: bool,

    /// Longest line accepted from the pool
    pub max_line_length: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: concat!("stratum-miner/", env!("CARGO_PKG_VERSION")).to_string(),
            suggest_difficulty: None,
            version_rolling: true,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Reconnect delay: 1 s doubling to a 60 s cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.next = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Stratum v1 client.
pub struct StratumV1Client {
    config: PoolConfig,

    /// Jobs currently valid on hardware
    jobs: Arc<JobTable>,

    handles: HandleAllocator,

    /// Where new work goes
    work_tx: mpsc::Sender<Work>,

    /// Shares and difficulty suggestions from the rest of the miner
    command_rx: mpsc::Receiver<ClientCommand>,

    shutdown: CancellationToken,

    /// Subscription id from the last subscribe, offered on reconnect
    resume_session: Option<String>,
}

impl StratumV1Client {
    pub fn new(
        config: PoolConfig,
        jobs: Arc<JobTable>,
        work_tx: mpsc::Sender<Work>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = HandleAllocator::new(jobs.capacity());
        Self {
            config,
            jobs,
            handles,
            work_tx,
            command_rx,
            shutdown,
            resume_session: None,
        }
    }

    /// Connect, mine, and reconnect until shutdown.
    ///
    /// Only returns an error for a pool URL that can never work.
    pub async fn run(mut self) -> StratumResult<()> {
        let mut backoff = Backoff::new();

        loop {
            debug!(phase = ?SessionPhase::Disconnected, pool = %self.config.url, "Connecting");
            let connect = Connection::connect(&self.config.url, self.config.max_line_length);
            let conn = tokio::select! {
                conn = connect => conn,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let mut session = Session::new();
            let result = match conn {
                Ok(conn) => {
                    info!(pool = %self.config.url, "Connected to pool");
                    self.run_session(conn, &mut session).await
                }
                Err(e) => Err(e),
            };

            // Nothing issued under the old session may be hashed or submitted
            self.jobs.invalidate_all();

            let stats = session.stats();
            if stats.submitted > 0 {
                info!(
                    submitted = stats.submitted,
                    accepted = stats.accepted,
                    rejected = stats.rejected,
                    "Session share totals"
                );
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match result {
                Ok(()) => {}
                Err(StratumError::InvalidUrl(url)) => return Err(StratumError::InvalidUrl(url)),
                Err(StratumError::ReconnectRequested) => info!("Reconnecting at pool's request"),
                Err(e) => warn!(error = %e, "Pool session ended"),
            }

            if session.reached_mining() {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            debug!(phase = ?SessionPhase::Reconnecting, delay = ?delay, "Waiting to reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Drive one connection until it fails, the pool asks us to reconnect,
    /// or shutdown is requested (the only `Ok` exit).
    pub(crate) async fn run_session(
        &mut self,
        mut conn: impl Transport,
        session: &mut Session,
    ) -> StratumResult<()> {
        self.handshake(&mut conn, session).await?;
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

        loop {
            tokio::select! {
                line = conn.read_line() => {
                    let Some(line) = line? else {
                        info!("Connection closed by pool");
                        return Err(StratumError::Disconnected);
                    };
                    match parser::parse(&line, session.pending()) {
                        Ok(message) => self.handle_message(session, message)?,
                        Err(e) => warn!(error = %e, line = %line, "Ignoring malformed message from pool"),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(&mut conn, session, cmd).await?;
                }

                _ = tokio::time::sleep_until(deadline), if session.phase() < SessionPhase::Authorized => {
                    warn!(phase = ?session.phase(), "Pool did not complete handshake");
                    return Err(StratumError::Timeout);
                }

                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Write the opening requests: configure, subscribe, authorize, and
    /// optionally suggest_difficulty.
    async fn handshake(&mut self, conn: &mut dyn Transport, session: &mut Session) -> StratumResult<()> {
        if self.config.version_rolling {
            let id = session.track(RequestKind::Configure);
            let params = json!([
                ["version-rolling"],
                {
                    "version-rolling.mask": format!("{:08x}", VERSION_ROLLING_MASK),
                    "version-rolling.min-bit-count": VERSION_ROLLING_MIN_BITS
                }
            ]);
            conn.write_message(&JsonRpcRequest::new(id, "mining.configure", params))
                .await?;
        }

        let id = session.track(RequestKind::Subscribe);
        let params = match &self.resume_session {
            Some(session_id) => json!([&self.config.user_agent, session_id]),
            None => json!([&self.config.user_agent]),
        };
        conn.write_message(&JsonRpcRequest::new(id, "mining.subscribe", params))
            .await?;

        let id = session.track(RequestKind::Authorize);
        let params = json!([&self.config.username, &self.config.password]);
        conn.write_message(&JsonRpcRequest::new(id, "mining.authorize", params))
            .await?;

        if let Some(difficulty) = self.config.suggest_difficulty {
            self.suggest_difficulty(conn, session, difficulty).await?;
        }

        debug!(pool = %self.config.url, "Handshake sent");
        Ok(())
    }

    /// Send `mining.suggest_difficulty`.
    ///
    /// Sent as a request with an id rather than a notification: some pools
    /// disconnect clients that send it with `id: null`. Pools that honour it
    /// answer with `mining.set_difficulty`; many also reply with an error,
    /// which is only logged.
    async fn suggest_difficulty(
        &mut self,
        conn: &mut dyn Transport,
        session: &mut Session,
        difficulty: f64,
    ) -> StratumResult<()> {
        let id = session.track(RequestKind::SuggestDifficulty);
        trace!(difficulty, "Suggesting difficulty to pool");
        conn.write_message(&JsonRpcRequest::new(
            id,
            "mining.suggest_difficulty",
            json!([difficulty_value(difficulty)]),
        ))
        .await
    }

    fn handle_message(&mut self, session: &mut Session, message: ProtocolMessage) -> StratumResult<()> {
        match message {
            ProtocolMessage::Notify { job, clean_jobs } => {
                self.dispatch_job(session, job, clean_jobs);
            }
            ProtocolMessage::SetDifficulty(difficulty) => {
                info!(difficulty, "Pool difficulty set");
                session.set_difficulty(difficulty);
            }
            ProtocolMessage::SetVersionMask(mask) => {
                if self.config.version_rolling {
                    debug!(mask = %format!("{:#010x}", mask), "Pool set version mask");
                    session.set_version_mask(mask);
                } else {
                    debug!("Ignoring version mask, rolling disabled");
                }
            }
            ProtocolMessage::Reconnect { host, port } => {
                if host.is_some() || port.is_some() {
                    info!(
                        host = host.as_deref().unwrap_or("-"),
                        port = ?port,
                        "Pool suggested another endpoint; reconnecting to configured pool"
                    );
                }
                return Err(StratumError::ReconnectRequested);
            }
            ProtocolMessage::Result { id, success, payload } => {
                session.complete(id);
                self.handle_result(session, success, payload)?;
            }
            ProtocolMessage::Unknown => {
                trace!("Ignoring unrecognised message");
            }
        }
        Ok(())
    }

    fn handle_result(
        &mut self,
        session: &mut Session,
        success: bool,
        payload: ResultPayload,
    ) -> StratumResult<()> {
        match payload {
            ResultPayload::Subscribe {
                extranonce1,
                extranonce2_size,
                session_id,
            } => {
                info!(
                    extranonce1 = %hex::encode(&extranonce1),
                    extranonce2_size,
                    "Subscribed"
                );
                session
                    .on_subscribed(ExtranonceGrant {
                        extranonce1,
                        extranonce2_size,
                    })
                    .map_err(|e| StratumError::SubscriptionFailed(e.to_string()))?;
                self.resume_session = session_id;
            }

            ResultPayload::Configure { version_mask } => {
                match version_mask {
                    Some(mask) => debug!(mask = %format!("{:#010x}", mask), "Pool authorized version rolling"),
                    None => debug!("Pool declined version rolling"),
                }
                session.on_configured(version_mask);
            }

            ResultPayload::Ack { request, error } => {
                let reason = error.unwrap_or_else(|| "pool returned false".to_string());
                match request {
                    RequestKind::Subscribe => {
                        // A stale resume id is a common reason; start fresh
                        self.resume_session = None;
                        return Err(StratumError::SubscriptionFailed(reason));
                    }
                    RequestKind::Configure => session.on_configured(None),
                    RequestKind::Authorize if success => {
                        info!(worker = %self.config.username, "Authorized");
                        session.on_authorized();
                    }
                    RequestKind::Authorize => {
                        error!(worker = %self.config.username, reason = %reason, "Authorization failed");
                        return Err(StratumError::AuthorizationFailed(reason));
                    }
                    RequestKind::SuggestDifficulty => {
                        debug!(success, "Pool answered suggest_difficulty");
                    }
                    RequestKind::Submit { job_id, nonce } => {
                        session.record_share_result(success);
                        let nonce = format!("{:#010x}", nonce);
                        if success {
                            info!(job_id = %job_id, nonce = %nonce, "Share accepted");
                        } else {
                            warn!(job_id = %job_id, nonce = %nonce, reason = %reason, "Share rejected");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Turn a notify into an installed job and a work item.
    fn dispatch_job(&mut self, session: &mut Session, mut job: MiningJob, clean_jobs: bool) {
        let Some(grant) = session.grant().cloned() else {
            warn!(job_id = %job.job_id, "Job received before subscription result, dropping");
            return;
        };
        let Some(extranonce2) = session.next_extranonce2() else {
            return;
        };

        if clean_jobs {
            self.jobs.invalidate_all();
        }

        job.version_mask = session.version_mask().unwrap_or(0);
        let active = ActiveJob {
            job,
            extranonce1: grant.extranonce1,
            extranonce2,
            pool_difficulty: session.difficulty(),
        };

        let handle = self.handles.next_handle();
        if let Err(e) = self.jobs.install(handle, active.clone()) {
            error!(error = %e, "Failed to install job");
            return;
        }
        session.on_job();

        debug!(
            handle,
            job_id = %active.job.job_id,
            extranonce2 = %active.extranonce2,
            difficulty = active.pool_difficulty,
            clean_jobs,
            "New job"
        );

        let work = Work {
            handle,
            job: active,
            clean_jobs,
        };
        match self.work_tx.try_send(work) {
            Ok(()) => {}
            Err(TrySendError::Full(work)) => {
                warn!(handle = work.handle, "Board busy, job not dispatched");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Board gone, job not dispatched");
            }
        }
    }

    async fn handle_command(
        &mut self,
        conn: &mut dyn Transport,
        session: &mut Session,
        cmd: ClientCommand,
    ) -> StratumResult<()> {
        match cmd {
            ClientCommand::SubmitShare(share) => {
                if session.phase() < SessionPhase::Authorized {
                    warn!(job_id = %share.job_id, phase = ?session.phase(), "Not authorized, dropping share");
                    return Ok(());
                }

                let id = session.track(RequestKind::Submit {
                    job_id: share.job_id.clone(),
                    nonce: share.nonce,
                });
                let params = SubmitParams::new(&self.config.username, share);
                debug!(pool = %self.config.url, job_id = %params.job_id, "Submitting share");
                conn.write_message(&JsonRpcRequest::new(
                    id,
                    "mining.submit",
                    Value::Array(params.to_stratum_json()),
                ))
                .await
            }
            ClientCommand::SuggestDifficulty(difficulty) => {
                self.suggest_difficulty(conn, session, difficulty).await
            }
        }
    }
}

/// Whole difficulties go out as JSON integers, which every pool accepts.
fn difficulty_value(difficulty: f64) -> Value {
    if difficulty.fract() == 0.0 && difficulty > 0.0 && difficulty < u64::MAX as f64 {
        json!(difficulty as u64)
    } else {
        json!(difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum_v1::connection::MockTransport;
    use crate::stratum_v1::messages::Share;
    use crate::types::Extranonce2;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const PREV_HASH: &str = "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000";

    struct Rig {
        client: StratumV1Client,
        jobs: Arc<JobTable>,
        work_rx: mpsc::Receiver<Work>,
        command_tx: mpsc::Sender<ClientCommand>,
        shutdown: CancellationToken,
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            url: "test:3333".to_string(),
            username: "worker".to_string(),
            password: "x".to_string(),
            user_agent: "test-agent".to_string(),
            ..Default::default()
        }
    }

    fn rig(config: PoolConfig) -> Rig {
        let jobs = Arc::new(JobTable::new(8));
        let (work_tx, work_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let client = StratumV1Client::new(config, jobs.clone(), work_tx, command_rx, shutdown.clone());
        Rig {
            client,
            jobs,
            work_rx,
            command_tx,
            shutdown,
        }
    }

    fn notify(job_id: &str, clean_jobs: bool) -> Value {
        json!({
            "id": null,
            "method": "mining.notify",
            "params": [job_id, PREV_HASH, "01000000", "ffffffff", [], "20000000", "1703a30c", "6553f100", clean_jobs]
        })
    }

    fn subscribe_result() -> Value {
        json!({
            "id": 1,
            "result": [[["mining.notify", "sub-7"]], "08000002", 4],
            "error": null
        })
    }

    fn feed(client: &mut StratumV1Client, session: &mut Session, msg: Value) -> StratumResult<()> {
        let message = parser::parse(&msg.to_string(), session.pending()).expect("parse");
        client.handle_message(session, message)
    }

    fn share(job_id: &str) -> Share {
        Share {
            job_id: job_id.to_string(),
            extranonce2: Extranonce2::with_value(1, 4).unwrap(),
            ntime: 0x6553f100,
            nonce: 0x0000abcd,
            version_bits: None,
        }
    }

    /// Session that has sent its handshake and received subscribe,
    /// configure and authorize results.
    async fn authorized_session(client: &mut StratumV1Client) -> Session {
        let (mut transport, _handle) = MockTransport::pair();
        let mut session = Session::new();
        client.handshake(&mut transport, &mut session).await.unwrap();
        feed(client, &mut session, subscribe_result()).unwrap();
        feed(
            client,
            &mut session,
            json!({"id": 2, "result": {"version-rolling": true, "version-rolling.mask": "1fffe000"}, "error": null}),
        )
        .unwrap();
        feed(client, &mut session, json!({"id": 3, "result": true, "error": null})).unwrap();
        assert_eq!(session.phase(), SessionPhase::Authorized);
        session
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Backoff::INITIAL);
    }

    #[test]
    fn test_difficulty_value() {
        assert_eq!(difficulty_value(512.0), json!(512));
        assert_eq!(difficulty_value(0.5), json!(0.5));
    }

    #[tokio::test]
    async fn test_handshake_order_and_ids() {
        let mut config = test_config();
        config.suggest_difficulty = Some(1024.0);
        let mut rig = rig(config);
        let (mut transport, mut handle) = MockTransport::pair();
        let mut session = Session::new();

        rig.client.handshake(&mut transport, &mut session).await.unwrap();

        let configure = handle.recv().await;
        assert_eq!((configure.id, configure.method.as_str()), (Some(2), "mining.configure"));
        assert_eq!(configure.params[0], json!(["version-rolling"]));
        assert_eq!(configure.params[1]["version-rolling.mask"], "1fffe000");

        let subscribe = handle.recv().await;
        assert_eq!((subscribe.id, subscribe.method.as_str()), (Some(1), "mining.subscribe"));
        assert_eq!(subscribe.params, json!(["test-agent"]));

        let authorize = handle.recv().await;
        assert_eq!((authorize.id, authorize.method.as_str()), (Some(3), "mining.authorize"));
        assert_eq!(authorize.params, json!(["worker", "x"]));

        let suggest = handle.recv().await;
        assert_eq!((suggest.id, suggest.method.as_str()), (Some(4), "mining.suggest_difficulty"));
        assert_eq!(suggest.params, json!([1024]));

        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_handshake_without_version_rolling() {
        let mut config = test_config();
        config.version_rolling = false;
        let mut rig = rig(config);
        let (mut transport, mut handle) = MockTransport::pair();
        let mut session = Session::new();

        rig.client.handshake(&mut transport, &mut session).await.unwrap();

        assert_eq!(handle.recv().await.method, "mining.subscribe");
        assert_eq!(handle.recv().await.method, "mining.authorize");
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_acks_in_request_order_reach_configured() {
        let mut rig = rig(test_config());
        let (mut transport, _handle) = MockTransport::pair();
        let mut session = Session::new();
        rig.client.handshake(&mut transport, &mut session).await.unwrap();

        feed(
            &mut rig.client,
            &mut session,
            json!({"id": 2, "result": {"version-rolling": true, "version-rolling.mask": "1fffe000"}, "error": null}),
        )
        .unwrap();
        assert_eq!(session.phase(), SessionPhase::Connected);

        feed(&mut rig.client, &mut session, subscribe_result()).unwrap();
        assert_eq!(session.phase(), SessionPhase::Configured);
        assert_eq!(session.version_mask(), Some(0x1fffe000));

        feed(&mut rig.client, &mut session, json!({"id": 3, "result": true, "error": null})).unwrap();
        assert_eq!(session.phase(), SessionPhase::Authorized);
    }

    #[tokio::test]
    async fn test_job_before_subscribe_dropped() {
        let mut rig = rig(test_config());
        let (mut transport, _handle) = MockTransport::pair();
        let mut session = Session::new();
        rig.client.handshake(&mut transport, &mut session).await.unwrap();

        feed(&mut rig.client, &mut session, notify("early", false)).unwrap();

        assert_eq!(rig.jobs.valid_count(), 0);
        assert!(rig.work_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_job_dispatch() {
        let mut rig = rig(test_config());
        let mut session = authorized_session(&mut rig.client).await;

        feed(
            &mut rig.client,
            &mut session,
            json!({"id": null, "method": "mining.set_difficulty", "params": [2048]}),
        )
        .unwrap();
        feed(&mut rig.client, &mut session, notify("j1", false)).unwrap();
        feed(&mut rig.client, &mut session, notify("j2", false)).unwrap();
        assert_eq!(session.phase(), SessionPhase::Mining);

        let first = rig.work_rx.try_recv().unwrap();
        let second = rig.work_rx.try_recv().unwrap();
        assert_eq!((first.handle, second.handle), (0, 1));

        let job = rig.jobs.snapshot(0).unwrap();
        assert_eq!(job.job.job_id, "j1");
        assert_eq!(job.extranonce1, vec![0x08, 0, 0, 0x02]);
        assert_eq!(job.extranonce2.size(), 4);
        assert_eq!(job.extranonce2.value(), 0);
        assert_eq!(job.pool_difficulty, 2048.0);
        assert_eq!(job.job.version_mask, VERSION_ROLLING_MASK);

        // Each job gets its own extranonce2
        assert_eq!(rig.jobs.snapshot(1).unwrap().extranonce2.value(), 1);
    }

    #[tokio::test]
    async fn test_difficulty_change_applies_to_later_jobs_only() {
        let mut rig = rig(test_config());
        let mut session = authorized_session(&mut rig.client).await;

        feed(&mut rig.client, &mut session, notify("before", false)).unwrap();
        feed(
            &mut rig.client,
            &mut session,
            json!({"id": null, "method": "mining.set_difficulty", "params": [64]}),
        )
        .unwrap();
        feed(&mut rig.client, &mut session, notify("after", false)).unwrap();

        assert_eq!(rig.jobs.snapshot(0).unwrap().pool_difficulty, 1.0);
        assert_eq!(rig.jobs.snapshot(1).unwrap().pool_difficulty, 64.0);
    }

    #[tokio::test]
    async fn test_clean_jobs_invalidates_earlier_jobs() {
        let mut rig = rig(test_config());
        let mut session = authorized_session(&mut rig.client).await;

        feed(&mut rig.client, &mut session, notify("a", false)).unwrap();
        feed(&mut rig.client, &mut session, notify("b", false)).unwrap();
        feed(&mut rig.client, &mut session, notify("c", true)).unwrap();

        assert!(rig.jobs.snapshot(0).is_none());
        assert!(rig.jobs.snapshot(1).is_none());
        assert_eq!(rig.jobs.snapshot(2).unwrap().job.job_id, "c");
        assert_eq!(rig.jobs.valid_count(), 1);

        let work: Vec<_> = std::iter::from_fn(|| rig.work_rx.try_recv().ok()).collect();
        assert_eq!(work.len(), 3);
        assert!(work[2].clean_jobs);
    }

    #[tokio::test]
    async fn test_declined_rolling_gives_zero_mask() {
        let mut rig = rig(test_config());
        let (mut transport, _handle) = MockTransport::pair();
        let mut session = Session::new();
        rig.client.handshake(&mut transport, &mut session).await.unwrap();
        feed(&mut rig.client, &mut session, subscribe_result()).unwrap();
        feed(
            &mut rig.client,
            &mut session,
            json!({"id": 2, "result": null, "error": [20, "Unsupported", null]}),
        )
        .unwrap();
        feed(&mut rig.client, &mut session, json!({"id": 3, "result": true, "error": null})).unwrap();

        feed(&mut rig.client, &mut session, notify("a", false)).unwrap();
        assert_eq!(rig.jobs.snapshot(0).unwrap().job.version_mask, 0);
    }

    #[tokio::test]
    async fn test_submit_before_authorized_dropped() {
        let mut rig = rig(test_config());
        let (mut transport, mut handle) = MockTransport::pair();
        let mut session = Session::new();
        rig.client.handshake(&mut transport, &mut session).await.unwrap();
        while handle.try_recv().is_some() {}
        feed(&mut rig.client, &mut session, subscribe_result()).unwrap();

        rig.client
            .handle_command(&mut transport, &mut session, ClientCommand::SubmitShare(share("a")))
            .await
            .unwrap();

        assert!(handle.try_recv().is_none());
        assert_eq!(session.stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_submit_and_accounting() {
        let mut rig = rig(test_config());
        let mut session = authorized_session(&mut rig.client).await;
        let (mut transport, mut handle) = MockTransport::pair();

        rig.client
            .handle_command(&mut transport, &mut session, ClientCommand::SubmitShare(share("a")))
            .await
            .unwrap();
        let mut rolled = share("b");
        rolled.version_bits = Some(0x0000_6000);
        rig.client
            .handle_command(&mut transport, &mut session, ClientCommand::SubmitShare(rolled))
            .await
            .unwrap();

        let first = handle.recv().await;
        assert_eq!(first.method, "mining.submit");
        assert_eq!(first.id, Some(4));
        assert_eq!(
            first.params,
            json!(["worker", "a", "01000000", "6553f100", "0000abcd"])
        );
        let second = handle.recv().await;
        assert_eq!(second.id, Some(5));
        assert_eq!(second.params[5], "00006000");

        feed(&mut rig.client, &mut session, json!({"id": 4, "result": true, "error": null})).unwrap();
        feed(
            &mut rig.client,
            &mut session,
            json!({"id": 5, "result": null, "error": [23, "Low difficulty share", null]}),
        )
        .unwrap();

        let stats = session.stats();
        assert_eq!((stats.submitted, stats.accepted, stats.rejected), (2, 1, 1));
        assert!(session.pending().get(4).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_push_ends_session() {
        let mut rig = rig(test_config());
        let mut session = authorized_session(&mut rig.client).await;
        let result = feed(
            &mut rig.client,
            &mut session,
            json!({"id": null, "method": "client.reconnect", "params": ["elsewhere", 3333, 0]}),
        );
        assert!(matches!(result, Err(StratumError::ReconnectRequested)));
    }

    #[tokio::test]
    async fn test_authorization_failure_ends_session() {
        let mut rig = rig(test_config());
        let (mut transport, _handle) = MockTransport::pair();
        let mut session = Session::new();
        rig.client.handshake(&mut transport, &mut session).await.unwrap();

        let result = feed(
            &mut rig.client,
            &mut session,
            json!({"id": 3, "result": false, "error": null}),
        );
        assert!(matches!(result, Err(StratumError::AuthorizationFailed(_))));
    }

    #[tokio::test]
    async fn test_run_session_over_mock_transport() {
        let Rig {
            mut client,
            jobs,
            mut work_rx,
            command_tx,
            shutdown: _shutdown,
        } = rig(test_config());
        let (transport, mut handle) = MockTransport::pair();

        let task = tokio::spawn(async move {
            let mut session = Session::new();
            let result = client.run_session(transport, &mut session).await;
            (result, session)
        });

        for _ in 0..3 {
            handle.recv().await;
        }
        handle.send(subscribe_result());
        handle.send(json!({"id": 2, "result": {"version-rolling": true, "version-rolling.mask": "1fffe000"}, "error": null}));
        handle.send(json!({"id": 3, "result": true, "error": null}));
        handle.send_raw("{this is not json");
        handle.send(notify("live", true));

        let work = timeout(Duration::from_secs(5), work_rx.recv()).await.unwrap().unwrap();
        assert_eq!(work.job.job.job_id, "live");
        assert_eq!(jobs.valid_count(), 1);

        command_tx.send(ClientCommand::SubmitShare(share("live"))).await.unwrap();
        let submit = timeout(Duration::from_secs(5), handle.recv()).await.unwrap();
        assert_eq!(submit.method, "mining.submit");

        handle.send(json!({"id": null, "method": "client.reconnect", "params": []}));
        let (result, session) = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(StratumError::ReconnectRequested)));
        assert!(session.reached_mining());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        tokio::time::pause();
        let Rig { mut client, .. } = rig(test_config());
        let (transport, _handle) = MockTransport::pair();
        let mut session = Session::new();

        let result = client.run_session(transport, &mut session).await;
        assert!(matches!(result, Err(StratumError::Timeout)));
    }

    /// Read handshake lines from a raw socket until authorize arrives.
    async fn read_handshake(reader: &mut (impl AsyncBufReadExt + Unpin)) -> Vec<Value> {
        let mut seen = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            let msg: Value = serde_json::from_str(&line).unwrap();
            let done = msg["method"] == "mining.authorize";
            seen.push(msg);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_resets_session_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = test_config();
        config.url = format!("stratum+tcp://{}", addr);
        let Rig {
            client,
            jobs,
            mut work_rx,
            command_tx: _command_tx,
            shutdown,
        } = rig(config);
        let client_task = tokio::spawn(client.run());

        // First connection: get to mining, then ask for a reconnect
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let first = read_handshake(&mut reader).await;
        assert_eq!(first[1]["params"], json!(["test-agent"]));

        for msg in [
            subscribe_result(),
            json!({"id": 3, "result": true, "error": null}),
            notify("first", true),
        ] {
            write_half.write_all(format!("{}\n", msg).as_bytes()).await.unwrap();
        }
        let work = timeout(Duration::from_secs(5), work_rx.recv()).await.unwrap().unwrap();
        assert_eq!(work.job.job.job_id, "first");
        assert_eq!(jobs.valid_count(), 1);

        write_half
            .write_all(b"{\"id\":null,\"method\":\"client.reconnect\",\"params\":[]}\n")
            .await
            .unwrap();

        // Second connection: old jobs gone, ids restart, session id offered
        let (socket, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jobs.valid_count(), 0);

        let mut reader = BufReader::new(socket);
        let second = read_handshake(&mut reader).await;
        assert_eq!(second[0]["id"], 2);
        assert_eq!(second[1]["id"], 1);
        assert_eq!(second[1]["params"], json!(["test-agent", "sub-7"]));
        assert_eq!(second[2]["id"], 3);

        shutdown.cancel();
        let result = timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    /// Integration test: connect to the pool named by the environment.
    ///
    /// Ignored by default (requires network). Run with:
    ///
    /// ```bash
    /// MINER_POOL_URL="stratum+tcp://localhost:3333" \
    /// cargo test --lib test_pool_from_env -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_pool_from_env() {
        let url = std::env::var("MINER_POOL_URL").expect("MINER_POOL_URL not set");
        let username = std::env::var("MINER_POOL_USER")
            .unwrap_or_else(|_| "bc1qce93hy5rhg02s6aeu7mfdvxg76x66pqqtrvzs3.stratum-miner-test".to_string());

        let mut config = test_config();
        config.url = url;
        config.username = username;
        let Rig {
            client,
            jobs,
            mut work_rx,
            shutdown,
            ..
        } = rig(config);
        let client_task = tokio::spawn(client.run());

        let work = timeout(Duration::from_secs(30), work_rx.recv())
            .await
            .expect("no job from pool")
            .expect("work channel closed");
        println!("job {} at difficulty {}", work.job.job.job_id, work.job.pool_difficulty);
        assert!(jobs.snapshot(work.handle).is_some());

        shutdown.cancel();
        let _ = client_task.await;
    }
}
