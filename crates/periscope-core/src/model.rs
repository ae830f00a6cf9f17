//! The server-side model abstraction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::ModelPath;

/// Cell values travel as loosely typed JSON.
pub type Value = serde_json::Value;

/// Facet of a cell's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human-readable text for display.
    Display,
    /// Underlying raw value, suitable for editing.
    Raw,
}

/// Model access error, recoverable at the call site.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The addressed path no longer exists; the caller should drop the
    /// index and re-derive it from a higher-confidence ancestor.
    #[error("stale index: {0}")]
    StaleIndex(ModelPath),
    /// The role is not provided by this model.
    #[error("unknown role")]
    UnknownRole,
}

/// An abstract hierarchical table, addressed by path and role.
///
/// The implementation is authoritative: only it may originate structural
/// changes. Consumers on other processes see it through the sync protocol,
/// never directly.
pub trait Model {
    /// Number of rows under `parent`.
    ///
    /// # Errors
    /// `StaleIndex` if `parent` does not address an existing subtree.
    fn row_count(&self, parent: &ModelPath) -> Result<u32, ModelError>;

    /// Number of columns under `parent`.
    ///
    /// # Errors
    /// `StaleIndex` if `parent` does not address an existing subtree.
    fn column_count(&self, parent: &ModelPath) -> Result<u32, ModelError>;

    /// Value of the cell addressed by `path`, for one role.
    ///
    /// # Errors
    /// `StaleIndex` if `path` does not address an existing cell,
    /// `UnknownRole` if the role is not provided.
    fn value(&self, path: &ModelPath, role: Role) -> Result<Value, ModelError>;

    /// Write a cell value. Models are read-only by default.
    ///
    /// # Errors
    /// `StaleIndex` / `UnknownRole` as for [`Model::value`].
    fn set_value(&mut self, path: &ModelPath, role: Role, value: Value) -> Result<(), ModelError> {
        let _ = (role, value);
        Err(ModelError::StaleIndex(path.clone()))
    }
}
