//! Attach/launch orchestration over the ranked strategy set.

use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    process::Child,
    time::{sleep, timeout, Instant},
};

use periscope_core::AbiDescriptor;
use periscope_wire::{FrameCodec, Message, AGENT_ADDRESS_VAR, DEFAULT_PORT};

use crate::{
    abi_detect::{detect_abi, process_executable},
    debugger::{GdbInjector, LldbInjector},
    injector::{abi_mismatch, InjectionError, Injector, LaunchSpec},
    preload::PreloadInjector,
    probe_finder::find_probe,
    style::StyleInjector,
};

/// Exported function the probe runs once loaded into the target.
pub const PROBE_ENTRY: &str = "periscope_probe_attach";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A target with the agent injected and confirmed listening.
#[derive(Debug)]
pub struct InjectedAgent {
    pub pid: u32,
    pub addr: SocketAddr,
    pub abi: AbiDescriptor,
    /// Present for launched targets; dropping it kills the child.
    pub child: Option<Child>,
}

/// Tries injection strategies in ranked order until one produces a live,
/// listening agent. A strategy failing its self test or its attempt is
/// logged and skipped; only the last failure is surfaced when every
/// strategy is exhausted.
pub struct Launcher {
    probe_root: PathBuf,
    strategies: Vec<Box<dyn Injector>>,
    agent_addr: SocketAddr,
    ready_timeout: Duration,
}

impl Launcher {
    /// Ranked default strategy set: gdb, lldb, preload, style fallback.
    #[must_use]
    pub fn new(probe_root: impl Into<PathBuf>) -> Self {
        Self {
            probe_root: probe_root.into(),
            strategies: vec![
                Box::new(GdbInjector::new()),
                Box::new(LldbInjector::new()),
                Box::new(PreloadInjector::new()),
                Box::new(StyleInjector::new()),
            ],
            agent_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn Injector>>) -> Self {
        self.strategies = strategies;
        self
    }

    #[must_use]
    pub fn agent_addr(mut self, addr: SocketAddr) -> Self {
        self.agent_addr = addr;
        self
    }

    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Inject into the running process `pid`.
    ///
    /// The target's binary is checked against `abi` before any strategy
    /// touches the process, so an incompatible target is left undisturbed.
    ///
    /// # Errors
    /// `AbiMismatch` from the pre-check, or the last strategy failure once
    /// all of them have been tried.
    pub async fn attach(
        &self,
        pid: u32,
        abi: &AbiDescriptor,
    ) -> Result<InjectedAgent, InjectionError> {
        let executable = process_executable(pid)?;
        let detected = detect_abi(&executable)?;
        if !detected.matches(abi) {
            return Err(abi_mismatch(
                abi,
                format!(
                    "{} ({}-bit) at {}",
                    detected.architecture,
                    detected.pointer_width,
                    executable.display()
                ),
            ));
        }

        let probe = find_probe(&self.probe_root, abi)?;

        let mut last_error = None;
        for strategy in self.strategies.iter().filter(|s| s.supports_attach()) {
            if let Err(e) = strategy.self_test().await {
                tracing::warn!(strategy = strategy.name(), error = %e, "self test failed, skipping");
                last_error = Some(e);
                continue;
            }
            if !strategy.undoes_cleanly() {
                tracing::debug!(
                    strategy = strategy.name(),
                    "a failed attempt may leave the target disturbed"
                );
            }
            tracing::info!(strategy = strategy.name(), pid, "attaching");
            match strategy.attach(pid, &probe, PROBE_ENTRY).await {
                Ok(()) => {
                    self.wait_for_agent().await?;
                    return Ok(InjectedAgent {
                        pid,
                        addr: self.agent_addr,
                        abi: abi.clone(),
                        child: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "attach failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            InjectionError::ToolUnavailable("no attach-capable strategy configured".to_string())
        }))
    }

    /// Launch `spec` with the agent injected.
    ///
    /// # Errors
    /// `ToolUnavailable` when no payload or strategy fits, `Timeout` when a
    /// launched target never brings the agent up, or the last strategy
    /// failure once all have been tried.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
        abi: &AbiDescriptor,
    ) -> Result<InjectedAgent, InjectionError> {
        let probe = find_probe(&self.probe_root, abi)?;
        let spec = spec
            .clone()
            .env(AGENT_ADDRESS_VAR, self.agent_addr.to_string());

        let mut last_error = None;
        for strategy in self.strategies.iter().filter(|s| s.supports_launch()) {
            if let Err(e) = strategy.self_test().await {
                tracing::warn!(strategy = strategy.name(), error = %e, "self test failed, skipping");
                last_error = Some(e);
                continue;
            }
            tracing::info!(strategy = strategy.name(), program = %spec.program, "launching");
            match strategy.launch(&spec, &probe, PROBE_ENTRY).await {
                Ok(mut child) => match self.wait_for_agent().await {
                    Ok(()) => {
                        let pid = child.id().unwrap_or_default();
                        return Ok(InjectedAgent {
                            pid,
                            addr: self.agent_addr,
                            abi: abi.clone(),
                            child: Some(child),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            strategy = strategy.name(),
                            error = %e,
                            "agent never came up, killing target"
                        );
                        child.start_kill().ok();
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "launch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            InjectionError::ToolUnavailable("no launch-capable strategy configured".to_string())
        }))
    }

    /// Poll until the agent accepts a connection and sends its version
    /// announcement, within the ready timeout.
    async fn wait_for_agent(&self) -> Result<(), InjectionError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(InjectionError::Timeout(format!(
                    "agent not listening on {} after {:?}",
                    self.agent_addr, self.ready_timeout
                )));
            }

            match timeout(remaining, TcpStream::connect(self.agent_addr)).await {
                Ok(Ok(stream)) => {
                    if self.confirm_handshake(stream, deadline).await? {
                        return Ok(());
                    }
                }
                Ok(Err(_)) | Err(_) => {}
            }
            sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    /// A listening socket is not enough; the agent must speak first.
    async fn confirm_handshake(
        &self,
        mut stream: TcpStream,
        deadline: Instant,
    ) -> Result<bool, InjectionError> {
        let mut buf = BytesMut::new();
        loop {
            match FrameCodec::decode(&mut buf) {
                Ok(Some(Message::Handshake { version })) => {
                    tracing::debug!(version, addr = %self.agent_addr, "agent is up");
                    return Ok(true);
                }
                Ok(Some(_)) | Err(_) => return Ok(false),
                Ok(None) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(InjectionError::Timeout(format!(
                    "agent on {} accepted but never announced itself",
                    self.agent_addr
                )));
            }
            match timeout(remaining, stream.read_buf(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return Ok(false),
                Ok(Ok(_)) => {}
                Err(_) => {
                    return Err(InjectionError::Timeout(format!(
                        "agent on {} accepted but never announced itself",
                        self.agent_addr
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use periscope_core::BuildFlavor;
    use periscope_wire::PROTOCOL_VERSION;
    use tokio::io::AsyncWriteExt;

    fn host_abi() -> AbiDescriptor {
        AbiDescriptor::new(std::env::consts::ARCH, BuildFlavor::Release, 5, 4)
    }

    fn probe_root_for(abi: &AbiDescriptor) -> PathBuf {
        let root = std::env::temp_dir().join(format!("periscope-launcher-{}", std::process::id()));
        let dir = root.join(abi.id());
        std::fs::create_dir_all(&dir).unwrap();
        #[cfg(target_os = "macos")]
        let file = "libperiscope_probe.dylib";
        #[cfg(not(target_os = "macos"))]
        let file = "libperiscope_probe.so";
        std::fs::write(dir.join(file), b"stub").unwrap();
        root
    }

    /// An agent stand-in that accepts and immediately announces its version.
    async fn fake_agent() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = BytesMut::new();
                FrameCodec::encode(
                    &Message::Handshake {
                        version: PROTOCOL_VERSION,
                    },
                    &mut buf,
                )
                .unwrap();
                let _ = stream.write_all(&buf).await;
            }
        });
        addr
    }

    struct ScriptedInjector {
        name: &'static str,
        self_test_ok: bool,
        attach_ok: bool,
        attaches: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Injector for ScriptedInjector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports_attach(&self) -> bool {
            true
        }

        async fn self_test(&self) -> Result<(), InjectionError> {
            if self.self_test_ok {
                Ok(())
            } else {
                Err(InjectionError::ToolUnavailable(self.name.to_string()))
            }
        }

        async fn attach(
            &self,
            _pid: u32,
            _probe: &std::path::Path,
            _entry: &str,
        ) -> Result<(), InjectionError> {
            self.log.lock().unwrap().push(self.name);
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.attach_ok {
                Ok(())
            } else {
                Err(InjectionError::PermissionDenied(self.name.to_string()))
            }
        }
    }

    fn scripted(
        name: &'static str,
        self_test_ok: bool,
        attach_ok: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Box<dyn Injector> {
        Box::new(ScriptedInjector {
            name,
            self_test_ok,
            attach_ok,
            attaches: Arc::new(AtomicUsize::new(0)),
            log: Arc::clone(log),
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_self_test_falls_through_to_next_strategy() {
        let abi = host_abi();
        let agent = fake_agent().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let launcher = Launcher::new(probe_root_for(&abi))
            .with_strategies(vec![
                scripted("broken", false, true, &log),
                scripted("working", true, true, &log),
            ])
            .agent_addr(agent)
            .ready_timeout(Duration::from_secs(5));

        let injected = launcher.attach(std::process::id(), &abi).await.unwrap();
        assert_eq!(injected.pid, std::process::id());
        assert_eq!(*log.lock().unwrap(), vec!["working"]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abi_mismatch_leaves_target_untouched() {
        let mut wrong = host_abi();
        wrong.architecture = if wrong.architecture == "x86_64" {
            "aarch64".to_string()
        } else {
            "x86_64".to_string()
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let launcher = Launcher::new(probe_root_for(&host_abi()))
            .with_strategies(vec![scripted("eager", true, true, &log)]);

        let err = launcher.attach(std::process::id(), &wrong).await.unwrap_err();
        assert!(matches!(err, InjectionError::AbiMismatch { .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn last_failure_is_surfaced_when_all_strategies_fail() {
        let abi = host_abi();
        let log = Arc::new(Mutex::new(Vec::new()));
        let launcher = Launcher::new(probe_root_for(&abi)).with_strategies(vec![
            scripted("first", true, false, &log),
            scripted("second", true, false, &log),
        ]);

        let err = launcher.attach(std::process::id(), &abi).await.unwrap_err();
        assert!(matches!(err, InjectionError::PermissionDenied(msg) if msg == "second"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn readiness_times_out_without_an_agent() {
        // Port from the ephemeral range with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let launcher = Launcher::new(std::env::temp_dir())
            .agent_addr(addr)
            .ready_timeout(Duration::from_millis(300));
        let err = launcher.wait_for_agent().await.unwrap_err();
        assert!(matches!(err, InjectionError::Timeout(_)));
    }
}
