//! Injection of the observation agent into target processes.
//!
//! A family of interchangeable strategies behind one [`Injector`] interface:
//! debugger-driven attach (gdb, lldb), preload-based launch, and a
//! toolkit-plugin launch fallback. Strategies are tried in ranked order;
//! each one is independently self-testable and fails with a specific,
//! distinguishable [`InjectionError`].

pub mod abi_detect;
pub mod debugger;
pub mod injector;
pub mod launcher;
pub mod preload;
pub mod probe_finder;
pub mod style;

pub use abi_detect::{detect_abi, process_executable, DetectedAbi};
pub use debugger::{GdbInjector, LldbInjector};
pub use injector::{InjectionError, Injector, LaunchSpec};
pub use launcher::{InjectedAgent, Launcher, PROBE_ENTRY};
pub use preload::PreloadInjector;
pub use probe_finder::find_probe;
pub use style::StyleInjector;
