//! Probe library lookup.
//!
//! Probe payloads live under a root directory with one subdirectory per ABI
//! id, e.g. `<root>/tk5.4-x86_64-release/libperiscope_probe.so`. An exact id
//! match is preferred; otherwise any subdirectory whose parsed descriptor is
//! compatible with the target's will do.

use std::path::{Path, PathBuf};

use periscope_core::AbiDescriptor;

use crate::injector::InjectionError;

#[cfg(target_os = "macos")]
const PROBE_FILE: &str = "libperiscope_probe.dylib";
#[cfg(not(target_os = "macos"))]
const PROBE_FILE: &str = "libperiscope_probe.so";

/// Locate the probe library for `abi` under `probe_root`.
///
/// # Errors
/// `ToolUnavailable` when no compatible payload exists.
pub fn find_probe(probe_root: &Path, abi: &AbiDescriptor) -> Result<PathBuf, InjectionError> {
    let exact = probe_root.join(abi.id()).join(PROBE_FILE);
    if exact.is_file() {
        return Ok(exact);
    }

    let entries = std::fs::read_dir(probe_root).map_err(|e| {
        InjectionError::ToolUnavailable(format!(
            "probe root {} is unreadable: {e}",
            probe_root.display()
        ))
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(candidate) = name.parse::<AbiDescriptor>() else {
            continue;
        };
        if candidate.is_compatible(abi) {
            let path = entry.path().join(PROBE_FILE);
            if path.is_file() {
                tracing::debug!(
                    wanted = %abi.id(),
                    using = %candidate.id(),
                    "using compatible probe payload"
                );
                return Ok(path);
            }
        }
    }

    Err(InjectionError::ToolUnavailable(format!(
        "no probe payload for {} under {}",
        abi.id(),
        probe_root.display()
    )))
}
