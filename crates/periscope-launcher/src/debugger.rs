//! Debugger-driven injection (gdb and lldb).
//!
//! The debugger attaches (or launches under a breakpoint), forces a
//! `dlopen` of the probe library in the target, calls the probe entry
//! function, then detaches and quits. Attach cannot be undone cleanly: a
//! loaded library stays loaded, so these strategies report
//! `undoes_cleanly() == false`.

use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::injector::{InjectionError, Injector, LaunchSpec};

const DEBUGGER_TIMEOUT: Duration = Duration::from_secs(30);

/// `RTLD_NOW`, passed to the forced `dlopen`.
const RTLD_NOW: u32 = 2;

/// Which debugger flavor drives the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Gdb,
    Lldb,
}

impl Flavor {
    const fn default_binary(self) -> &'static str {
        match self {
            Self::Gdb => "gdb",
            Self::Lldb => "lldb",
        }
    }

    /// Flag that makes the debugger execute scripted commands and exit.
    const fn batch_flag(self) -> &'static str {
        match self {
            Self::Gdb => "-batch",
            Self::Lldb => "--batch",
        }
    }

    const fn command_flag(self) -> &'static str {
        match self {
            Self::Gdb => "-ex",
            Self::Lldb => "-o",
        }
    }

    fn inject_commands(self, probe: &Path, entry: &str) -> Vec<String> {
        let probe = probe.display();
        match self {
            Self::Gdb => vec![
                format!("call (void*) dlopen(\"{probe}\", {RTLD_NOW})"),
                format!("call (void) {entry}()"),
            ],
            Self::Lldb => vec![
                format!("expr (void*) dlopen(\"{probe}\", {RTLD_NOW})"),
                format!("expr (void) {entry}()"),
            ],
        }
    }
}

/// Shared engine for gdb/lldb strategies.
struct DebuggerEngine {
    flavor: Flavor,
    binary: String,
}

impl DebuggerEngine {
    fn new(flavor: Flavor, binary_override: Option<String>) -> Self {
        Self {
            flavor,
            binary: binary_override.unwrap_or_else(|| flavor.default_binary().to_string()),
        }
    }

    async fn self_test(&self) -> Result<(), InjectionError> {
        let binary = self.binary.clone();
        let found = tokio::task::spawn_blocking(move || which::which(binary))
            .await
            .map_err(|e| InjectionError::ToolUnavailable(e.to_string()))?;
        if found.is_err() {
            return Err(InjectionError::ToolUnavailable(format!(
                "debugger executable '{}' could not be found",
                self.binary
            )));
        }

        check_ptrace_scope()
    }

    async fn run(&self, args: Vec<String>) -> Result<(), InjectionError> {
        tracing::debug!(debugger = %self.binary, ?args, "running debugger");
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InjectionError::ToolUnavailable(format!("{}: {e}", self.binary)))?;

        let output = tokio::time::timeout(DEBUGGER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                InjectionError::Timeout(format!("{} did not finish in time", self.binary))
            })?
            .map_err(|e| InjectionError::ToolUnavailable(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            tracing::debug!(debugger = %self.binary, line, "debugger stderr");
        }
        if let Some(err) = classify_stderr(&stderr) {
            return Err(err);
        }
        if !output.status.success() {
            return Err(InjectionError::ToolUnavailable(format!(
                "{} exited with {}",
                self.binary, output.status
            )));
        }
        Ok(())
    }

    async fn attach(&self, pid: u32, probe: &Path, entry: &str) -> Result<(), InjectionError> {
        let mut args = vec![self.flavor.batch_flag().to_string(), "-p".to_string(), pid.to_string()];
        for cmd in self.flavor.inject_commands(probe, entry) {
            args.push(self.flavor.command_flag().to_string());
            args.push(cmd);
        }
        args.push(self.flavor.command_flag().to_string());
        args.push("detach".to_string());
        self.run(args).await
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        entry: &str,
    ) -> Result<Child, InjectionError> {
        // Run the target under the debugger, break at main, inject, then
        // keep the debugger alive as the parent of the target.
        let mut args = vec![self.flavor.batch_flag().to_string()];
        let mut script = match self.flavor {
            Flavor::Gdb => vec!["tbreak main".to_string(), "run".to_string()],
            Flavor::Lldb => vec![
                "breakpoint set --one-shot true --name main".to_string(),
                "run".to_string(),
            ],
        };
        script.extend(self.flavor.inject_commands(probe, entry));
        script.push("continue".to_string());
        for cmd in script {
            args.push(self.flavor.command_flag().to_string());
            args.push(cmd);
        }
        match self.flavor {
            Flavor::Gdb => {
                args.push("--args".to_string());
                args.push(spec.program.clone());
                args.extend(spec.args.iter().cloned());
            }
            Flavor::Lldb => {
                args.push("--".to_string());
                args.push(spec.program.clone());
                args.extend(spec.args.iter().cloned());
            }
        }

        tracing::debug!(debugger = %self.binary, program = %spec.program, "launching under debugger");
        Command::new(&self.binary)
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InjectionError::ToolUnavailable(format!("{}: {e}", self.binary)))
    }
}

/// The Yama security module can forbid attaching to non-children even for
/// the same user; surface that as a permission problem, not a tool problem.
fn check_ptrace_scope() -> Result<(), InjectionError> {
    match std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope") {
        Ok(scope) if scope.trim() != "0" => Err(InjectionError::PermissionDenied(
            "Yama security extension is blocking runtime attaching, \
             see /proc/sys/kernel/yama/ptrace_scope"
                .to_string(),
        )),
        _ => Ok(()),
    }
}

fn classify_stderr(stderr: &str) -> Option<InjectionError> {
    if stderr.contains("Operation not permitted") || stderr.contains("ptrace") {
        return Some(InjectionError::PermissionDenied(first_line(stderr)));
    }
    if stderr.contains("No such process") {
        return Some(InjectionError::NotFound(first_line(stderr)));
    }
    None
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

/// gdb-driven injection.
pub struct GdbInjector {
    engine: DebuggerEngine,
}

impl GdbInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(None)
    }

    #[must_use]
    pub fn with_binary(binary_override: Option<String>) -> Self {
        Self {
            engine: DebuggerEngine::new(Flavor::Gdb, binary_override),
        }
    }
}

impl Default for GdbInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Injector for GdbInjector {
    fn name(&self) -> &'static str {
        "gdb"
    }

    fn supports_attach(&self) -> bool {
        true
    }

    fn supports_launch(&self) -> bool {
        true
    }

    fn undoes_cleanly(&self) -> bool {
        false
    }

    async fn self_test(&self) -> Result<(), InjectionError> {
        self.engine.self_test().await
    }

    async fn attach(&self, pid: u32, probe: &Path, entry: &str) -> Result<(), InjectionError> {
        self.engine.attach(pid, probe, entry).await
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        entry: &str,
    ) -> Result<Child, InjectionError> {
        self.engine.launch(spec, probe, entry).await
    }
}

/// lldb-driven injection.
pub struct LldbInjector {
    engine: DebuggerEngine,
}

impl LldbInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(None)
    }

    #[must_use]
    pub fn with_binary(binary_override: Option<String>) -> Self {
        Self {
            engine: DebuggerEngine::new(Flavor::Lldb, binary_override),
        }
    }
}

impl Default for LldbInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Injector for LldbInjector {
    fn name(&self) -> &'static str {
        "lldb"
    }

    fn supports_attach(&self) -> bool {
        true
    }

    fn supports_launch(&self) -> bool {
        true
    }

    fn undoes_cleanly(&self) -> bool {
        false
    }

    async fn self_test(&self) -> Result<(), InjectionError> {
        self.engine.self_test().await
    }

    async fn attach(&self, pid: u32, probe: &Path, entry: &str) -> Result<(), InjectionError> {
        self.engine.attach(pid, probe, entry).await
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        probe: &Path,
        entry: &str,
    ) -> Result<Child, InjectionError> {
        self.engine.launch(spec, probe, entry).await
    }
}
