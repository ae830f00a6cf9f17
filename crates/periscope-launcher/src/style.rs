//! Toolkit-plugin launch fallback.
//!
//! Some targets sanitize the preload environment variable; UI toolkits
//! still load style plugins named on the command line from a directory
//! named in the plugin-path environment variable. Pointing both at the
//! probe gets it loaded without the dynamic linker's help. Lowest-ranked
//! strategy: it only works for toolkit applications that parse the flag.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::injector::{InjectionError, Injector, LaunchSpec};

const PLUGIN_PATH_VAR: &str = "PERISCOPE_STYLE_PLUGIN_PATH";
const STYLE_FLAG: &str = "-style";
const STYLE_NAME: &str = "periscope-injector";

pub struct StyleInjector;

impl StyleInjector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for StyleInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Injector for StyleInjector {
    fn name(&self) -> &'static str {
        "style"
    }

    fn supports_launch(&self) -> bool {
        true
    }

    async fn self_test(&self) -> Result<(), InjectionError> {
        Ok(())
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        _entry: &str,
    ) -> Result<Child, InjectionError> {
        let plugin_dir = probe.parent().ok_or_else(|| {
            InjectionError::ToolUnavailable(format!(
                "probe library {} has no parent directory",
                probe.display()
            ))
        })?;
        if !probe.exists() {
            return Err(InjectionError::ToolUnavailable(format!(
                "probe library {} does not exist",
                probe.display()
            )));
        }

        tracing::debug!(program = %spec.program, plugin_dir = %plugin_dir.display(), "style launch");
        Command::new(&spec.program)
            .args(&spec.args)
            .arg(STYLE_FLAG)
            .arg(STYLE_NAME)
            .envs(&spec.env)
            .env(PLUGIN_PATH_VAR, plugin_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => InjectionError::NotFound(spec.program.clone()),
                std::io::ErrorKind::PermissionDenied => {
                    InjectionError::PermissionDenied(format!("{}: {e}", spec.program))
                }
                _ => InjectionError::ToolUnavailable(format!("{}: {e}", spec.program)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_only() {
        let injector = StyleInjector::new();
        assert!(injector.supports_launch());
        assert!(!injector.supports_attach());
        assert!(injector.self_test().await.is_ok());
    }

    #[tokio::test]
    async fn missing_probe_is_reported() {
        let spec = LaunchSpec::new("/bin/true");
        let err = StyleInjector::new()
            .launch(&spec, Path::new("/nonexistent/dir/libprobe.so"), "entry")
            .await
            .unwrap_err();
        assert!(matches!(err, InjectionError::ToolUnavailable(_)));
    }
}
