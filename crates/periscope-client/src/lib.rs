//! Client side of the introspection protocol.
//!
//! [`Connection`] owns the socket lifecycle and handshake; [`RemoteModel`]
//! keeps a sparse, demand-driven mirror of the agent's object model, staying
//! eventually consistent under concurrent server-side mutation without ever
//! transferring the whole table.

pub mod connection;
pub mod discovery;
pub mod remote_model;

pub use connection::{
    ConnectError, Connection, ConnectionError, ConnectionEvent, ConnectionState,
};
pub use remote_model::{coalesce, FetchConfig, ModelEvent, RemoteModel};
