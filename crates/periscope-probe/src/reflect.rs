//! Reflection boundary between the host and the registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use periscope_core::Value;

/// Reflection failure inside the host.
#[derive(Debug, Clone, Error)]
#[error("reflection failed: {0}")]
pub struct ReflectError(pub String);

/// Capability set a registered object exposes to the agent.
///
/// Implemented per concrete host type. Methods are fallible on purpose: a
/// failure here must never cross the hook boundary as a panic or abort, it
/// is captured as an inconsistency marker on the registry entry instead.
pub trait Reflectable {
    /// Name of the concrete type, e.g. `Button`.
    ///
    /// # Errors
    /// Any reflection failure; the entry is flagged inconsistent.
    fn type_name(&self) -> Result<String, ReflectError>;

    /// Current attribute bag of the object.
    ///
    /// # Errors
    /// Any reflection failure; the entry is flagged inconsistent.
    fn attributes(&self) -> Result<Vec<(String, Value)>, ReflectError>;
}

/// Plain data snapshot of a [`Reflectable`], taken on the host context.
///
/// Capturing eagerly keeps host references out of the agent task: only this
/// owned snapshot crosses the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectData {
    pub type_name: String,
    pub attributes: Vec<(String, Value)>,
    /// Set when reflection failed part-way; the entry is served with
    /// whatever data could be captured.
    pub inconsistent: bool,
}

impl ObjectData {
    /// Snapshot `object`, downgrading reflection errors to an inconsistency
    /// marker.
    pub fn capture(object: &dyn Reflectable) -> Self {
        let mut inconsistent = false;

        let type_name = match object.type_name() {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(error = %e, "reflection failed for type name");
                inconsistent = true;
                "<unknown>".to_string()
            }
        };
        let attributes = match object.attributes() {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::warn!(%type_name, error = %e, "reflection failed for attributes");
                inconsistent = true;
                Vec::new()
            }
        };

        Self {
            type_name,
            attributes,
            inconsistent,
        }
    }
}
