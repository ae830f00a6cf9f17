//! Preload-based launch.
//!
//! The dynamic linker loads the probe before the target's own code runs, so
//! this is the cleanest strategy for new processes. It cannot attach to a
//! process that already exists.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::injector::{InjectionError, Injector, LaunchSpec};

#[cfg(target_os = "macos")]
const PRELOAD_VAR: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
const PRELOAD_VAR: &str = "LD_PRELOAD";

/// Name of the environment variable the probe reads to discover that it was
/// preloaded and should initialize itself on startup.
pub const PRELOAD_ENTRY_VAR: &str = "PERISCOPE_PRELOAD_ENTRY";

pub struct PreloadInjector;

impl PreloadInjector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for PreloadInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Injector for PreloadInjector {
    fn name(&self) -> &'static str {
        "preload"
    }

    fn supports_launch(&self) -> bool {
        true
    }

    async fn self_test(&self) -> Result<(), InjectionError> {
        // Nothing external to verify; the dynamic linker is always there.
        Ok(())
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        entry: &str,
    ) -> Result<Child, InjectionError> {
        if !probe.exists() {
            return Err(InjectionError::ToolUnavailable(format!(
                "probe library {} does not exist",
                probe.display()
            )));
        }

        let mut preload = probe.display().to_string();
        if let Some(existing) = spec.env.get(PRELOAD_VAR) {
            preload = format!("{preload}:{existing}");
        }

        tracing::debug!(program = %spec.program, probe = %probe.display(), "preload launch");
        Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .env(PRELOAD_VAR, preload)
            .env(PRELOAD_ENTRY_VAR, entry)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    InjectionError::NotFound(spec.program.clone())
                }
                std::io::ErrorKind::PermissionDenied => {
                    InjectionError::PermissionDenied(format!("{}: {e}", spec.program))
                }
                _ => InjectionError::ToolUnavailable(format!("{}: {e}", spec.program)),
            })
    }
}
