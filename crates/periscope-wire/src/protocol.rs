//! Protocol message vocabulary.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use periscope_core::{ModelPath, ObjectId, Role, RowRange, Value};

/// Current protocol version, negotiated during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Versions this build is willing to talk to. A peer outside this range is
/// rejected; there is no best-effort interoperability across versions.
pub const SUPPORTED_VERSIONS: RangeInclusive<u32> = 1..=1;

/// Default agent TCP port.
pub const DEFAULT_PORT: u16 = 11732;

/// UDP port used for discovery beacons.
pub const DISCOVERY_PORT: u16 = 13325;

/// Environment variable through which the launcher tells an injected agent
/// where to listen.
pub const AGENT_ADDRESS_VAR: &str = "PERISCOPE_ADDRESS";

/// Request correlation id, monotonic per connection.
pub type RequestId = u64;

/// Structural change kind for a row range under one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Rows were inserted at `range.start`; everything at or past it shifts
    /// down by `range.len`. Does not carry a new row total.
    Inserted,
    /// Rows in `range` were removed; everything past it shifts up.
    Removed,
    /// Rows in `range` moved to `to` under the same parent. Equivalent to a
    /// removal followed by an insertion for index-shifting purposes.
    Moved { to: u32 },
    /// Cell values in `range` changed; row counts are unaffected.
    DataChanged,
}

/// Object lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created,
    Destroyed,
}

/// Error codes carried in [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    VersionMismatch,
    Malformed,
    UnexpectedFirstMessage,
    UnknownRole,
    Internal,
}

/// One protocol message.
///
/// Messages on one connection are strictly ordered; requests and responses
/// are correlated by `request_id`, never by arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Mandatory first message in each direction. The agent sends its
    /// version unconditionally on accept; the client echoes the negotiated
    /// version back or closes.
    Handshake { version: u32 },
    /// Keepalive.
    Ping,
    Pong,
    /// Ask for the row/column extent under `path`.
    RowCountRequest { request_id: RequestId, path: ModelPath },
    RowCountResponse {
        request_id: RequestId,
        path: ModelPath,
        rows: u32,
        columns: u32,
    },
    /// Ask for cell values of `range` rows under `path`, one column, one role.
    DataRequest {
        request_id: RequestId,
        path: ModelPath,
        range: RowRange,
        column: u32,
        role: Role,
    },
    DataResponse {
        request_id: RequestId,
        path: ModelPath,
        range: RowRange,
        column: u32,
        role: Role,
        values: Vec<Value>,
    },
    /// The addressed path no longer exists on the server. Resolves the
    /// request without tearing down the connection.
    StaleIndex { request_id: RequestId },
    /// Write a cell value. The server applies it and reflects the result
    /// back as a `DataChanged` notification; there is no direct reply.
    SetDataRequest {
        path: ModelPath,
        role: Role,
        value: Value,
    },
    /// Server-push structural invalidation, applied client-side in arrival
    /// order.
    ChangeNotification {
        parent: ModelPath,
        range: RowRange,
        kind: ChangeKind,
    },
    /// A reflected object appeared or was destroyed.
    ObjectLifecycle {
        identity: ObjectId,
        event: LifecycleEvent,
    },
    /// Client acknowledgment of a `destroyed` lifecycle event; the agent may
    /// reclaim the tombstone once every connection has acked.
    LifecycleAck { identity: ObjectId },
    /// Terminal protocol-level error.
    Error { code: ErrorCode, detail: String },
}

impl Message {
    /// Frame type tag, written between the length prefix and the payload.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Handshake { .. } => 0,
            Self::Ping => 1,
            Self::Pong => 2,
            Self::RowCountRequest { .. } => 3,
            Self::RowCountResponse { .. } => 4,
            Self::DataRequest { .. } => 5,
            Self::DataResponse { .. } => 6,
            Self::StaleIndex { .. } => 7,
            Self::SetDataRequest { .. } => 8,
            Self::ChangeNotification { .. } => 9,
            Self::ObjectLifecycle { .. } => 10,
            Self::LifecycleAck { .. } => 11,
            Self::Error { .. } => 12,
        }
    }
}

/// Protocol violation. Fatal to the connection it occurred on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol version {theirs} is outside the supported range {}..={}", SUPPORTED_VERSIONS.start(), SUPPORTED_VERSIONS.end())]
    VersionMismatch { theirs: u32 },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("first message on the connection was not a handshake")]
    UnexpectedFirstMessage,
}

/// Discovery beacon payload, broadcast over UDP so clients can reject
/// incompatible targets before attempting a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    /// Human-readable target name, typically the program name.
    pub name: String,
    /// Host the agent listens on.
    pub host: String,
    /// TCP port the agent listens on.
    pub port: u16,
    /// ABI id of the target, see `AbiDescriptor::id`.
    pub abi: String,
    /// Protocol version the agent speaks.
    pub protocol_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serialization_is_tagged() {
        let msg = Message::RowCountRequest {
            request_id: 7,
            path: ModelPath::root().child(2, 0),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("row_count_request"));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn change_kind_moved_carries_destination() {
        let msg = Message::ChangeNotification {
            parent: ModelPath::root(),
            range: RowRange::new(2, 3),
            kind: ChangeKind::Moved { to: 9 },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn tags_are_distinct() {
        let msgs = [
            Message::Handshake { version: 1 },
            Message::Ping,
            Message::Pong,
            Message::StaleIndex { request_id: 0 },
            Message::LifecycleAck {
                identity: ObjectId(1),
            },
        ];
        let mut tags: Vec<u8> = msgs.iter().map(Message::tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), msgs.len());
    }
}
