//! Wire protocol for agent-client communication.
//!
//! Every message is framed as `[length][type tag][payload]` and carried over
//! a single ordered stream per connection. The first message on a new
//! connection is always [`Message::Handshake`], sent by the agent.

pub mod codec;
pub mod protocol;

pub use codec::{FrameCodec, MAX_FRAME_LEN};
pub use protocol::{
    Beacon, ChangeKind, ErrorCode, LifecycleEvent, Message, ProtocolError, RequestId,
    AGENT_ADDRESS_VAR, DEFAULT_PORT, DISCOVERY_PORT, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
};
