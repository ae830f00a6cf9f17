//! The in-process agent.
//!
//! The agent is a passenger inside the target: it owns the canonical object
//! registry, exposes it as a hierarchical model, and serves that model to
//! remote clients over the wire protocol. Registry mutations arrive from the
//! host's object lifecycle hooks via [`AgentHandle`]; the registry itself is
//! owned and mutated exclusively by the agent's serving task, and all socket
//! I/O happens off the host's execution context.

pub mod agent;
pub mod discovery;
pub mod reflect;
pub mod registry;
pub mod tree_model;

pub use agent::{Agent, AgentConfig, AgentHandle, DeploymentMode};
pub use reflect::{ObjectData, ReflectError, Reflectable};
pub use registry::{ConnectionId, DestroyOutcome, ObjectRegistry, RegistryEntry, RegistryError};
pub use tree_model::{COLUMN_ATTRIBUTES, COLUMN_OBJECT};
