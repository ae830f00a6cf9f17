//! Core abstractions for live process introspection.
//!
//! This crate provides the vocabulary shared by every other component:
//! - `AbiDescriptor` - binary compatibility fingerprint of a target process
//! - `ObjectId` - stable, monotonic, process-unique object identity
//! - `ModelPath` / `RowRange` / `Role` - addressing into hierarchical tables
//! - The server-side `Model` trait and `ModelError`

pub mod abi;
pub mod identity;
pub mod model;
pub mod path;

pub use abi::{AbiDescriptor, BuildFlavor};
pub use identity::{IdentityAllocator, ObjectId};
pub use model::{Model, ModelError, Role, Value};
pub use path::{ModelPath, PathStep, RowRange};
