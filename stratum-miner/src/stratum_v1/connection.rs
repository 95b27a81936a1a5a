//! TCP connection carrying newline-delimited JSON.
//!
//! [`Connection`] frames the TCP stream with [`LineCodec`] in both
//! directions. The [`Transport`] trait abstracts line I/O so the client can
//! run over TCP in production or over channels in tests.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use super::codec::{INITIAL_CAPACITY, LineCodec};
use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Line-level I/O for the Stratum protocol.
#[async_trait]
pub trait Transport: Send {
    /// Read the next non-empty line.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_line(&mut self) -> StratumResult<Option<String>>;

    /// Serialize and write one request.
    async fn write_message(&mut self, msg: &JsonRpcRequest) -> StratumResult<()>;
}

/// Framed TCP connection to a pool.
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, LineCodec>,
    writer: FramedWrite<OwnedWriteHalf, LineCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream, max_line_length: usize) -> Self {
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: FramedRead::with_capacity(
                read_half,
                LineCodec::with_max_length(max_line_length),
                INITIAL_CAPACITY,
            ),
            writer: FramedWrite::new(write_half, LineCodec::with_max_length(max_line_length)),
        }
    }

    /// Connect to a Stratum pool.
    ///
    /// Accepts `stratum+tcp://host:port`, `tcp://host:port` or a bare
    /// `host:port`.
    pub async fn connect(url: &str, max_line_length: usize) -> StratumResult<Self> {
        let addr = host_port(url)?;
        debug!(addr = %addr, "Connecting to pool");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| StratumError::ConnectionFailed(format!("{} timed out", addr)))?
            .map_err(|e| StratumError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        debug!("Connected to pool");
        Ok(Self::new(stream, max_line_length))
    }
}

/// Strip the scheme from a pool URL, leaving `host:port`.
pub fn host_port(url: &str) -> StratumResult<&str> {
    let addr = url
        .strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr),
        _ => Err(StratumError::InvalidUrl(url.to_string())),
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_line(&mut self) -> StratumResult<Option<String>> {
        while let Some(line) = self.reader.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            trace!(rx = %line, "Received line");
            return Ok(Some(line));
        }
        Ok(None)
    }

    async fn write_message(&mut self, msg: &JsonRpcRequest) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");
        self.writer.send(json).await
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcRequest>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcRequest>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_line(&mut self) -> StratumResult<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcRequest) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Feed a line to the client.
    pub fn send(&self, msg: serde_json::Value) {
        self.tx.send(msg.to_string()).expect("transport dropped");
    }

    /// Feed raw text to the client.
    pub fn send_raw(&self, line: &str) {
        self.tx.send(line.to_string()).expect("transport dropped");
    }

    /// Receive a request the client wrote.
    pub async fn recv(&mut self) -> JsonRpcRequest {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive a request if one is already waiting.
    pub fn try_recv(&mut self) -> Option<JsonRpcRequest> {
        self.rx.try_recv().ok()
    }
}
