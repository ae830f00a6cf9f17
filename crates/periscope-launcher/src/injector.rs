//! The strategy interface and its error taxonomy.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;

use periscope_core::AbiDescriptor;

/// Injection failure. Terminal for the strategy attempt that produced it;
/// the caller may try an alternative strategy.
#[derive(Debug, Error)]
pub enum InjectionError {
    /// No such process, or the launch executable does not exist.
    #[error("target not found: {0}")]
    NotFound(String),
    /// The target's binary compatibility class does not match the hint.
    #[error("ABI mismatch: expected {expected}, target is {found}")]
    AbiMismatch { expected: String, found: String },
    /// The operating system refused, e.g. a kernel security module blocking
    /// runtime attach.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A required helper binary or payload is missing or unusable.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),
    /// The strategy ran, but the agent did not reach a listening state
    /// within the bounded timeout.
    #[error("agent did not come up: {0}")]
    Timeout(String),
}

/// A command to launch, with arguments and extra environment.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Parse a full command line, shell-style.
    ///
    /// # Errors
    /// `NotFound` when the line is empty or unparseable.
    pub fn parse(command_line: &str) -> Result<Self, InjectionError> {
        let mut parts = shlex::split(command_line)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| InjectionError::NotFound(command_line.to_string()))?;
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
            env: HashMap::new(),
        })
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One injection strategy.
///
/// `attach` loads the probe library into a running process and calls its
/// entry function; `launch` starts a new process with the probe loaded.
/// Neither waits for the agent to come up; readiness is the caller's
/// responsibility so that every strategy shares the same bounded-timeout
/// semantics.
#[async_trait]
pub trait Injector: Send + Sync {
    /// Strategy name, used in logs and error reports.
    fn name(&self) -> &'static str;

    fn supports_attach(&self) -> bool {
        false
    }

    fn supports_launch(&self) -> bool {
        false
    }

    /// Whether a failed attach leaves the target undisturbed. Strategies
    /// that cannot cleanly undo must return `false` so callers can warn.
    fn undoes_cleanly(&self) -> bool {
        true
    }

    /// Check that the strategy is operational (helper binaries present,
    /// no platform blockers) without touching any real target.
    ///
    /// # Errors
    /// `ToolUnavailable` or `PermissionDenied` describing the blocker.
    async fn self_test(&self) -> Result<(), InjectionError>;

    /// Load `probe` into the running process `pid` and call `entry` in it.
    ///
    /// # Errors
    /// Any [`InjectionError`]; `ToolUnavailable` if unsupported.
    async fn attach(&self, pid: u32, probe: &Path, entry: &str) -> Result<(), InjectionError> {
        let _ = (pid, probe, entry);
        Err(InjectionError::ToolUnavailable(format!(
            "{} cannot attach to a running process",
            self.name()
        )))
    }

    /// Start `spec` with `probe` arranged to load and `entry` to run.
    ///
    /// # Errors
    /// Any [`InjectionError`]; `ToolUnavailable` if unsupported.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        entry: &str,
    ) -> Result<Child, InjectionError> {
        let _ = (spec, probe, entry);
        Err(InjectionError::ToolUnavailable(format!(
            "{} cannot launch a new process",
            self.name()
        )))
    }
}

/// Helper shared by attach pre-checks: hint vs detected ABI.
pub(crate) fn abi_mismatch(expected: &AbiDescriptor, found: impl Into<String>) -> InjectionError {
    InjectionError::AbiMismatch {
        expected: expected.id(),
        found: found.into(),
    }
}
