//! Client-side connection lifecycle.
//!
//! The agent speaks first: the one and only acceptable first message is its
//! version announcement. Anything else is a protocol violation and the
//! socket is dropped before any model traffic happens. Version rejection is
//! terminal; reconnecting is always an explicit caller decision, never a
//! silent background retry.

use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

use periscope_wire::{FrameCodec, Message, ProtocolError, PROTOCOL_VERSION, SUPPORTED_VERSIONS};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level failure, distinct from protocol violations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Nothing is listening, or the peer actively refused.
    #[error("connection refused: {0}")]
    Refused(String),
    /// An established connection went away underneath us.
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("connection timed out: {0}")]
    Timeout(String),
}

/// Anything that can make [`Connection::connect`] fail.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Per-connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingServerVersion,
    VersionAccepted,
    /// Terminal. A rejected connection is never reused.
    VersionRejected,
    Ready,
    Closed,
    Lost,
}

/// What the reader task reports to the consumer.
#[derive(Debug)]
pub enum ConnectionEvent {
    Received(Message),
    /// The agent hung up or the transport failed.
    Lost(ConnectionError),
}

/// An established, version-checked connection.
///
/// Owns a writer task (serializing outbound messages in submission order)
/// and a reader task (decoding inbound frames); both end when the
/// connection does. Messages submitted through [`Connection::sender`] are
/// delivered strictly in order.
#[derive(Debug)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: ConnectionState,
    peer: SocketAddr,
    version: u32,
}

impl Connection {
    /// Connect, await the agent's version announcement, and echo ours.
    ///
    /// # Errors
    /// `Refused`/`Timeout` for transport failures; `UnexpectedFirstMessage`
    /// when the agent's first message is not a handshake;
    /// `VersionMismatch` when its version is outside [`SUPPORTED_VERSIONS`].
    /// No model traffic is ever sent on a connection that fails here.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ConnectError> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<Self, ConnectError> {
        tracing::debug!(%addr, "connecting");
        let mut stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| ConnectionError::Refused(format!("{addr}: {e}")))?;

        // State: AwaitingServerVersion. The agent must speak first.
        let mut buf = BytesMut::with_capacity(256);
        let first = timeout(limit, read_one(&mut stream, &mut buf))
            .await
            .map_err(|_| ConnectionError::Timeout(format!("awaiting version from {addr}")))??;

        let version = match first {
            Message::Handshake { version } => version,
            other => {
                tracing::warn!(%addr, tag = other.tag(), "first message was not a handshake");
                return Err(ProtocolError::UnexpectedFirstMessage.into());
            }
        };
        if !SUPPORTED_VERSIONS.contains(&version) {
            tracing::warn!(%addr, version, "agent version rejected");
            return Err(ProtocolError::VersionMismatch { theirs: version }.into());
        }

        // Echo acceptance, then hand the socket to the reader/writer tasks.
        let mut out = BytesMut::new();
        FrameCodec::encode(
            &Message::Handshake {
                version: PROTOCOL_VERSION,
            },
            &mut out,
        )?;
        stream
            .write_all(&out)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;

        let (tx, events) = start_io(stream, buf);
        tracing::info!(%addr, version, "connection ready");
        Ok(Self {
            tx,
            events,
            state: ConnectionState::Ready,
            peer: addr,
            version,
        })
    }

    /// Sender for outbound messages; clones share the ordered stream.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.tx.clone()
    }

    /// Next inbound event. `None` after the connection is closed or lost.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Lost) {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(ConnectionEvent::Lost(_)) | None => self.state = ConnectionState::Lost,
            Some(ConnectionEvent::Received(_)) => {}
        }
        event
    }

    /// Deliberate local close.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.events.close();
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The version the agent announced.
    #[must_use]
    pub const fn agent_version(&self) -> u32 {
        self.version
    }
}

async fn read_one(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Message, ConnectError> {
    loop {
        if let Some(msg) = FrameCodec::decode(buf).map_err(ConnectError::Protocol)? {
            return Ok(msg);
        }
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::Lost("agent hung up".to_string()).into());
        }
    }
}

fn start_io(
    stream: TcpStream,
    residue: BytesMut,
) -> (
    mpsc::UnboundedSender<Message>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(msg) = rx.recv().await {
            buf.clear();
            if let Err(e) = FrameCodec::encode(&msg, &mut buf) {
                tracing::error!(error = %e, "failed to encode outbound message");
                continue;
            }
            if write_half.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        // Bytes that arrived along with the handshake are processed first.
        let mut buf = residue;
        loop {
            loop {
                match FrameCodec::decode(&mut buf) {
                    Ok(Some(msg)) => {
                        if event_tx.send(ConnectionEvent::Received(msg)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = event_tx.send(ConnectionEvent::Lost(ConnectionError::Lost(
                            e.to_string(),
                        )));
                        return;
                    }
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = event_tx.send(ConnectionEvent::Lost(ConnectionError::Lost(
                        "agent hung up".to_string(),
                    )));
                    return;
                }
                Err(e) => {
                    let _ = event_tx
                        .send(ConnectionEvent::Lost(ConnectionError::Lost(e.to_string())));
                    return;
                }
                Ok(_) => {}
            }
        }
    });

    (tx, event_rx)
}
