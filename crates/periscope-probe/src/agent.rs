//! The agent's serving loop.
//!
//! A single task owns the registry. Host lifecycle hooks push commands into
//! it through [`AgentHandle`] without blocking; accepted connections feed
//! decoded messages into it through per-connection reader tasks. All
//! responses and change notifications leave through per-connection writer
//! tasks, so nothing here ever blocks on a socket.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use uuid::Uuid;

use periscope_core::{
    AbiDescriptor, IdentityAllocator, Model, ModelError, ModelPath, ObjectId, Role, RowRange,
    Value,
};
use periscope_wire::{
    Beacon, ChangeKind, ErrorCode, FrameCodec, LifecycleEvent, Message, PROTOCOL_VERSION,
    SUPPORTED_VERSIONS,
};

use crate::{
    discovery,
    reflect::{ObjectData, Reflectable},
    registry::{ConnectionId, ObjectRegistry},
};

/// How many clients the agent accepts concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Colocated with its single consumer.
    InProcess,
    /// Reachable over the network by several independent clients.
    OutOfProcess { max_connections: usize },
}

impl DeploymentMode {
    #[must_use]
    pub const fn max_connections(self) -> usize {
        match self {
            Self::InProcess => 1,
            Self::OutOfProcess { max_connections } => max_connections,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Human-readable target name, advertised in discovery beacons.
    pub name: String,
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// ABI of the hosting process.
    pub abi: AbiDescriptor,
    pub mode: DeploymentMode,
    /// Broadcast discovery beacons while serving.
    pub announce: bool,
}

impl AgentConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, abi: AbiDescriptor) -> Self {
        Self {
            name: name.into(),
            bind: SocketAddr::from(([127, 0, 0, 1], periscope_wire::DEFAULT_PORT)),
            abi,
            mode: DeploymentMode::OutOfProcess { max_connections: 4 },
            announce: false,
        }
    }

    /// Take the bind address from the launcher-provided environment
    /// variable, if set and parseable.
    #[must_use]
    pub fn bind_from_env(mut self) -> Self {
        if let Ok(addr) = std::env::var(periscope_wire::AGENT_ADDRESS_VAR) {
            match addr.parse() {
                Ok(addr) => self.bind = addr,
                Err(_) => {
                    tracing::warn!(%addr, "ignoring unparseable agent address from environment");
                }
            }
        }
        self
    }
}

enum AgentCommand {
    Register {
        id: ObjectId,
        parent: Option<ObjectId>,
        data: ObjectData,
    },
    Destroy {
        id: ObjectId,
    },
    SetAttribute {
        id: ObjectId,
        name: String,
        value: Value,
    },
    Shutdown,
}

/// Handle the host's lifecycle hooks talk to.
///
/// Every method is non-blocking: reflection happens inline on the caller's
/// context (errors downgraded to inconsistency markers), the resulting
/// snapshot is queued for the agent task.
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::UnboundedSender<AgentCommand>,
    identities: Arc<Mutex<IdentityAllocator>>,
    local_addr: SocketAddr,
}

impl AgentHandle {
    /// Register a freshly created host object; returns its permanent id.
    pub fn object_created(&self, parent: Option<ObjectId>, object: &dyn Reflectable) -> ObjectId {
        // A poisoned lock only means another hook panicked mid-allocation;
        // the counter itself is still valid.
        let id = self
            .identities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate();
        let data = ObjectData::capture(object);
        let _ = self.cmd_tx.send(AgentCommand::Register { id, parent, data });
        id
    }

    /// Record the destruction of a host object.
    pub fn object_destroyed(&self, id: ObjectId) {
        let _ = self.cmd_tx.send(AgentCommand::Destroy { id });
    }

    /// Record an attribute change on a host object.
    pub fn attribute_changed(&self, id: ObjectId, name: impl Into<String>, value: Value) {
        let _ = self.cmd_tx.send(AgentCommand::SetAttribute {
            id,
            name: name.into(),
            value,
        });
    }

    /// Ask the serving loop to wind down.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Shutdown);
    }

    /// The address the agent is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// The in-process agent.
pub struct Agent;

impl Agent {
    /// Bind the listener and spawn the serving loop.
    ///
    /// The returned handle is the only way to mutate the registry; dropping
    /// every clone of it (or calling [`AgentHandle::shutdown`]) stops the
    /// loop.
    ///
    /// # Errors
    /// Propagates listener bind failures.
    pub async fn spawn(config: AgentConfig) -> io::Result<AgentHandle> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, abi = %config.abi.id(), "agent listening");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = AgentHandle {
            cmd_tx,
            identities: Arc::new(Mutex::new(IdentityAllocator::new())),
            local_addr,
        };

        tokio::spawn(serve_loop(config, listener, local_addr, cmd_rx));
        Ok(handle)
    }
}

enum ConnEvent {
    Inbound(Message),
    /// The reader saw something that is not a valid frame.
    Violation(String),
    Closed,
}

struct Conn {
    tx: mpsc::UnboundedSender<Message>,
    /// Handshake completed with a supported version.
    ready: bool,
}

#[allow(clippy::too_many_lines)]
async fn serve_loop(
    config: AgentConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    mut cmd_rx: mpsc::UnboundedReceiver<AgentCommand>,
) {
    let mut registry = ObjectRegistry::new();
    let mut conns: HashMap<ConnectionId, Conn> = HashMap::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(ConnectionId, ConnEvent)>();

    let announcer = config.announce.then(|| {
        let beacon = Beacon {
            name: config.name.clone(),
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            abi: config.abi.id(),
            protocol_version: PROTOCOL_VERSION,
        };
        tokio::spawn(discovery::announce(beacon))
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        if conns.len() >= config.mode.max_connections() {
                            tracing::warn!(%peer, "connection limit reached, refusing");
                            drop(socket);
                            continue;
                        }
                        let conn_id = Uuid::new_v4();
                        let tx = start_connection(conn_id, socket, event_tx.clone());
                        // The protocol version is unconditionally the first
                        // message on every new connection.
                        let _ = tx.send(Message::Handshake { version: PROTOCOL_VERSION });
                        conns.insert(conn_id, Conn { tx, ready: false });
                        tracing::debug!(%conn_id, %peer, "connection accepted");
                    }
                    Err(e) => {
                        // Transient (EMFILE and the like): keep serving the
                        // connections that exist.
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            Some((conn_id, event)) = event_rx.recv() => {
                match event {
                    ConnEvent::Inbound(msg) => {
                        handle_message(&mut registry, &mut conns, conn_id, msg);
                    }
                    ConnEvent::Violation(detail) => {
                        tracing::warn!(%conn_id, %detail, "protocol violation");
                        if let Some(conn) = conns.get(&conn_id) {
                            let _ = conn.tx.send(Message::Error {
                                code: ErrorCode::Malformed,
                                detail,
                            });
                        }
                        close_connection(&mut registry, &mut conns, conn_id);
                    }
                    ConnEvent::Closed => {
                        close_connection(&mut registry, &mut conns, conn_id);
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(AgentCommand::Register { id, parent, data }) => {
                        apply_register(&mut registry, &conns, id, parent, data);
                    }
                    Some(AgentCommand::Destroy { id }) => {
                        apply_destroy(&mut registry, &conns, id);
                    }
                    Some(AgentCommand::SetAttribute { id, name, value }) => {
                        apply_set_attribute(&mut registry, &conns, id, &name, value);
                    }
                    Some(AgentCommand::Shutdown) | None => {
                        tracing::info!("agent shutting down");
                        break;
                    }
                }
            }
        }
    }

    if let Some(task) = announcer {
        task.abort();
    }
}

/// Spawn reader and writer tasks for one accepted socket.
fn start_connection(
    conn_id: ConnectionId,
    socket: TcpStream,
    event_tx: mpsc::UnboundedSender<(ConnectionId, ConnEvent)>,
) -> mpsc::UnboundedSender<Message> {
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(msg) = rx.recv().await {
            buf.clear();
            if let Err(e) = FrameCodec::encode(&msg, &mut buf) {
                tracing::error!(%conn_id, error = %e, "failed to encode message");
                continue;
            }
            if write_half.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            loop {
                match FrameCodec::decode(&mut buf) {
                    Ok(Some(msg)) => {
                        if event_tx.send((conn_id, ConnEvent::Inbound(msg))).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = event_tx.send((conn_id, ConnEvent::Violation(e.to_string())));
                        return;
                    }
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = event_tx.send((conn_id, ConnEvent::Closed));
                    return;
                }
                Ok(_) => {}
            }
        }
    });

    tx
}

fn close_connection(
    registry: &mut ObjectRegistry,
    conns: &mut HashMap<ConnectionId, Conn>,
    conn_id: ConnectionId,
) {
    if conns.remove(&conn_id).is_some() {
        tracing::debug!(%conn_id, "connection closed");
        registry.connection_closed(conn_id);
        reclaim(registry);
    }
}

fn reclaim(registry: &mut ObjectRegistry) {
    for id in registry.reclaim_acknowledged() {
        tracing::debug!(object = %id, "tombstone reclaimed");
    }
}

fn handle_message(
    registry: &mut ObjectRegistry,
    conns: &mut HashMap<ConnectionId, Conn>,
    conn_id: ConnectionId,
    msg: Message,
) {
    let Some(conn) = conns.get(&conn_id) else {
        return;
    };

    if !conn.ready {
        match msg {
            Message::Handshake { version } if SUPPORTED_VERSIONS.contains(&version) => {
                tracing::debug!(%conn_id, version, "handshake complete");
                conns.get_mut(&conn_id).expect("checked above").ready = true;
            }
            Message::Handshake { version } => {
                tracing::warn!(%conn_id, version, "unsupported protocol version");
                let _ = conn.tx.send(Message::Error {
                    code: ErrorCode::VersionMismatch,
                    detail: format!(
                        "version {version} not in {}..={}",
                        SUPPORTED_VERSIONS.start(),
                        SUPPORTED_VERSIONS.end()
                    ),
                });
                close_connection(registry, conns, conn_id);
            }
            other => {
                tracing::warn!(%conn_id, tag = other.tag(), "model traffic before handshake");
                let _ = conn.tx.send(Message::Error {
                    code: ErrorCode::UnexpectedFirstMessage,
                    detail: "handshake required".to_string(),
                });
                close_connection(registry, conns, conn_id);
            }
        }
        return;
    }

    match msg {
        Message::Ping => {
            let _ = conn.tx.send(Message::Pong);
        }
        Message::RowCountRequest { request_id, path } => {
            let reply = match (registry.row_count(&path), registry.column_count(&path)) {
                (Ok(rows), Ok(columns)) => Message::RowCountResponse {
                    request_id,
                    path,
                    rows,
                    columns,
                },
                _ => Message::StaleIndex { request_id },
            };
            let _ = conn.tx.send(reply);
        }
        Message::DataRequest {
            request_id,
            path,
            range,
            column,
            role,
        } => {
            let reply = serve_data(registry, request_id, path, range, column, role);
            let _ = conn.tx.send(reply);
        }
        Message::SetDataRequest { path, role, value } => {
            match registry.set_value(&path, role, value) {
                Ok(()) => {
                    let parent = path.parent().unwrap_or_else(ModelPath::root);
                    let row = path.last().map_or(0, |s| s.row);
                    notify_all(conns, &Message::ChangeNotification {
                        parent,
                        range: RowRange::new(row, 1),
                        kind: ChangeKind::DataChanged,
                    });
                }
                Err(ModelError::UnknownRole) => {
                    let _ = conn.tx.send(Message::Error {
                        code: ErrorCode::UnknownRole,
                        detail: "cell is not writable through this role".to_string(),
                    });
                }
                Err(ModelError::StaleIndex(p)) => {
                    tracing::debug!(path = %p, "set request against stale index, dropped");
                }
            }
        }
        Message::LifecycleAck { identity } => {
            registry.acknowledge(conn_id, identity);
            reclaim(registry);
        }
        Message::Handshake { .. } => {
            // Mandatory first-and-only-once; a repeat is a violation.
            let _ = conn.tx.send(Message::Error {
                code: ErrorCode::UnexpectedFirstMessage,
                detail: "duplicate handshake".to_string(),
            });
            close_connection(registry, conns, conn_id);
        }
        other => {
            tracing::debug!(%conn_id, tag = other.tag(), "ignoring unexpected message");
        }
    }
}

fn serve_data(
    registry: &ObjectRegistry,
    request_id: u64,
    path: ModelPath,
    range: RowRange,
    column: u32,
    role: Role,
) -> Message {
    let Ok(rows) = registry.row_count(&path) else {
        return Message::StaleIndex { request_id };
    };

    // Clamp to the current extent; a span that raced a removal shrinks
    // rather than failing.
    let start = range.start.min(rows);
    let end = range.end().min(rows);
    let clamped = RowRange::new(start, end - start);

    let mut values = Vec::with_capacity(clamped.len as usize);
    for row in clamped.rows() {
        match registry.value(&path.child(row, column), role) {
            Ok(v) => values.push(v),
            Err(ModelError::UnknownRole) => {
                return Message::Error {
                    code: ErrorCode::UnknownRole,
                    detail: format!("role not provided for column {column}"),
                };
            }
            Err(ModelError::StaleIndex(_)) => {
                return Message::StaleIndex { request_id };
            }
        }
    }

    Message::DataResponse {
        request_id,
        path,
        range: clamped,
        column,
        role,
        values,
    }
}

fn notify_all(conns: &HashMap<ConnectionId, Conn>, msg: &Message) {
    for conn in conns.values().filter(|c| c.ready) {
        let _ = conn.tx.send(msg.clone());
    }
}

fn apply_register(
    registry: &mut ObjectRegistry,
    conns: &HashMap<ConnectionId, Conn>,
    id: ObjectId,
    parent: Option<ObjectId>,
    data: ObjectData,
) {
    match registry.insert(id, parent, data) {
        Ok((parent, row)) => {
            let parent_path = parent
                .and_then(|pid| registry.path_of(pid))
                .unwrap_or_else(ModelPath::root);
            notify_all(conns, &Message::ChangeNotification {
                parent: parent_path,
                range: RowRange::new(row, 1),
                kind: ChangeKind::Inserted,
            });
            notify_all(conns, &Message::ObjectLifecycle {
                identity: id,
                event: LifecycleEvent::Created,
            });
        }
        Err(e) => tracing::error!(object = %id, error = %e, "registering object failed"),
    }
}

fn apply_destroy(
    registry: &mut ObjectRegistry,
    conns: &HashMap<ConnectionId, Conn>,
    id: ObjectId,
) {
    let observers = conns
        .iter()
        .filter(|(_, c)| c.ready)
        .map(|(cid, _)| *cid)
        .collect();

    // Parent path must be taken before the tree mutates.
    let parent_path = registry
        .entry(id)
        .and_then(|e| e.parent)
        .and_then(|pid| registry.path_of(pid))
        .unwrap_or_else(ModelPath::root);

    match registry.destroy(id, observers) {
        Ok(outcome) => {
            notify_all(conns, &Message::ChangeNotification {
                parent: parent_path,
                range: RowRange::new(outcome.row, 1),
                kind: ChangeKind::Removed,
            });
            for (_, root_row) in outcome.reparented {
                notify_all(conns, &Message::ChangeNotification {
                    parent: ModelPath::root(),
                    range: RowRange::new(root_row, 1),
                    kind: ChangeKind::Inserted,
                });
            }
            notify_all(conns, &Message::ObjectLifecycle {
                identity: id,
                event: LifecycleEvent::Destroyed,
            });
            // With nobody to ack, the tombstone is immediately reclaimable.
            reclaim(registry);
        }
        Err(e) => tracing::error!(object = %id, error = %e, "destroying object failed"),
    }
}

fn apply_set_attribute(
    registry: &mut ObjectRegistry,
    conns: &HashMap<ConnectionId, Conn>,
    id: ObjectId,
    name: &str,
    value: Value,
) {
    let location = registry
        .path_of(id)
        .and_then(|p| Some((p.parent()?, p.last()?.row)));

    match registry.set_attribute(id, name, value) {
        Ok(()) => {
            if let Some((parent, row)) = location {
                notify_all(conns, &Message::ChangeNotification {
                    parent,
                    range: RowRange::new(row, 1),
                    kind: ChangeKind::DataChanged,
                });
            }
        }
        Err(e) => tracing::debug!(object = %id, error = %e, "attribute change dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::ReflectError;

    struct Fixture {
        type_name: &'static str,
    }

    impl Reflectable for Fixture {
        fn type_name(&self) -> Result<String, ReflectError> {
            Ok(self.type_name.to_string())
        }

        fn attributes(&self) -> Result<Vec<(String, Value)>, ReflectError> {
            Ok(vec![("visible".into(), Value::from(true))])
        }
    }

    async fn test_agent() -> AgentHandle {
        let mut config = AgentConfig::new(
            "test-target",
            AbiDescriptor::new("x86_64", periscope_core::BuildFlavor::Release, 5, 4),
        );
        config.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        Agent::spawn(config).await.unwrap()
    }

    async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Message> {
        loop {
            if let Some(msg) = FrameCodec::decode(buf).ok()? {
                return Some(msg);
            }
            if stream.read_buf(buf).await.ok()? == 0 {
                return None;
            }
        }
    }

    async fn send_frame(stream: &mut TcpStream, msg: &Message) {
        let mut buf = BytesMut::new();
        FrameCodec::encode(msg, &mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn first_message_is_the_protocol_version() {
        let handle = test_agent().await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = BytesMut::new();

        let first = read_frame(&mut stream, &mut buf).await.unwrap();
        assert_eq!(first, Message::Handshake {
            version: PROTOCOL_VERSION
        });
    }

    #[tokio::test]
    async fn version_mismatch_is_terminal() {
        let handle = test_agent().await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = BytesMut::new();

        read_frame(&mut stream, &mut buf).await.unwrap();
        send_frame(&mut stream, &Message::Handshake { version: 999 }).await;

        let reply = read_frame(&mut stream, &mut buf).await.unwrap();
        assert!(matches!(reply, Message::Error {
            code: ErrorCode::VersionMismatch,
            ..
        }));
        // Server hangs up afterwards.
        assert_eq!(read_frame(&mut stream, &mut buf).await, None);
    }

    #[tokio::test]
    async fn model_traffic_before_handshake_is_rejected() {
        let handle = test_agent().await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = BytesMut::new();

        read_frame(&mut stream, &mut buf).await.unwrap();
        send_frame(&mut stream, &Message::RowCountRequest {
            request_id: 1,
            path: ModelPath::root(),
        })
        .await;

        let reply = read_frame(&mut stream, &mut buf).await.unwrap();
        assert!(matches!(reply, Message::Error {
            code: ErrorCode::UnexpectedFirstMessage,
            ..
        }));
        assert_eq!(read_frame(&mut stream, &mut buf).await, None);
    }

    #[tokio::test]
    async fn serves_row_counts_and_data_after_handshake() {
        let handle = test_agent().await;
        let window = handle.object_created(None, &Fixture { type_name: "Window" });
        handle.object_created(Some(window), &Fixture { type_name: "Button" });

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = BytesMut::new();
        read_frame(&mut stream, &mut buf).await.unwrap();
        send_frame(&mut stream, &Message::Handshake {
            version: PROTOCOL_VERSION,
        })
        .await;

        send_frame(&mut stream, &Message::RowCountRequest {
            request_id: 1,
            path: ModelPath::root(),
        })
        .await;
        let reply = read_frame(&mut stream, &mut buf).await.unwrap();
        assert_eq!(reply, Message::RowCountResponse {
            request_id: 1,
            path: ModelPath::root(),
            rows: 1,
            columns: 2,
        });

        send_frame(&mut stream, &Message::DataRequest {
            request_id: 2,
            path: ModelPath::root(),
            range: RowRange::new(0, 8),
            column: 0,
            role: Role::Display,
        })
        .await;
        let reply = read_frame(&mut stream, &mut buf).await.unwrap();
        let Message::DataResponse { range, values, .. } = reply else {
            panic!("expected data response, got {reply:?}");
        };
        // Span clamped to the single existing row.
        assert_eq!(range, RowRange::new(0, 1));
        assert_eq!(values, vec![Value::from("Window")]);
    }

    #[tokio::test]
    async fn destruction_is_pushed_and_ack_reclaims() {
        let handle = test_agent().await;
        let window = handle.object_created(None, &Fixture { type_name: "Window" });

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = BytesMut::new();
        read_frame(&mut stream, &mut buf).await.unwrap();
        send_frame(&mut stream, &Message::Handshake {
            version: PROTOCOL_VERSION,
        })
        .await;
        // Synchronize: a served request proves the handshake was processed.
        send_frame(&mut stream, &Message::RowCountRequest {
            request_id: 1,
            path: ModelPath::root(),
        })
        .await;
        read_frame(&mut stream, &mut buf).await.unwrap();

        handle.object_destroyed(window);

        let change = read_frame(&mut stream, &mut buf).await.unwrap();
        assert_eq!(change, Message::ChangeNotification {
            parent: ModelPath::root(),
            range: RowRange::new(0, 1),
            kind: ChangeKind::Removed,
        });
        let lifecycle = read_frame(&mut stream, &mut buf).await.unwrap();
        assert_eq!(lifecycle, Message::ObjectLifecycle {
            identity: window,
            event: LifecycleEvent::Destroyed,
        });

        send_frame(&mut stream, &Message::LifecycleAck { identity: window }).await;
        // No reply expected; a ping round-trip proves it was processed.
        send_frame(&mut stream, &Message::Ping).await;
        assert_eq!(read_frame(&mut stream, &mut buf).await, Some(Message::Pong));
    }
}
