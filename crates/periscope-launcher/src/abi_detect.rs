//! Target ABI detection from executable headers.
//!
//! Reads just enough of the ELF header to classify architecture and pointer
//! width; the toolkit version half of the descriptor comes from the caller's
//! hint, since it is a property of the libraries the target loads rather
//! than of the executable image itself.

use std::path::{Path, PathBuf};

use periscope_core::AbiDescriptor;

use crate::injector::InjectionError;

/// The architecture facts detectable from a binary alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedAbi {
    pub architecture: String,
    pub pointer_width: u8,
}

impl DetectedAbi {
    /// Whether a hinted descriptor is plausible for this binary.
    #[must_use]
    pub fn matches(&self, hint: &AbiDescriptor) -> bool {
        self.architecture == hint.architecture && self.pointer_width == hint.pointer_width
    }
}

/// Resolve the executable image of a running process.
///
/// # Errors
/// `NotFound` when the process does not exist, `PermissionDenied` when the
/// kernel refuses to reveal it.
pub fn process_executable(pid: u32) -> Result<PathBuf, InjectionError> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_link(format!("/proc/{pid}/exe")) {
            Ok(path) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                InjectionError::PermissionDenied(format!("cannot inspect process {pid}: {e}")),
            ),
            Err(_) => Err(InjectionError::NotFound(format!("process {pid}"))),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(InjectionError::ToolUnavailable(format!(
            "process inspection not implemented on this platform (pid {pid})"
        )))
    }
}

/// Classify an executable by its ELF header.
///
/// # Errors
/// `NotFound` for unreadable paths, `AbiMismatch` with a descriptive
/// `found` string for non-ELF or unknown-architecture binaries.
pub fn detect_abi(executable: &Path) -> Result<DetectedAbi, InjectionError> {
    let bytes = std::fs::read(executable)
        .map_err(|e| InjectionError::NotFound(format!("{}: {e}", executable.display())))?;
    parse_elf_header(&bytes).ok_or_else(|| InjectionError::AbiMismatch {
        expected: "an ELF executable".to_string(),
        found: format!("{}: unrecognized binary format", executable.display()),
    })
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

fn parse_elf_header(bytes: &[u8]) -> Option<DetectedAbi> {
    if bytes.len() < 20 || bytes[..4] != ELF_MAGIC {
        return None;
    }

    let pointer_width = match bytes[4] {
        1 => 32,
        2 => 64,
        _ => return None,
    };
    let little_endian = match bytes[5] {
        1 => true,
        2 => false,
        _ => return None,
    };

    let machine = if little_endian {
        u16::from_le_bytes([bytes[18], bytes[19]])
    } else {
        u16::from_be_bytes([bytes[18], bytes[19]])
    };
    let architecture = match machine {
        0x03 => "i686",
        0x28 => "arm",
        0x3e => "x86_64",
        0xb7 => "aarch64",
        _ => return None,
    };

    Some(DetectedAbi {
        architecture: architecture.to_string(),
        pointer_width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::BuildFlavor;

    fn elf(class: u8, machine: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = class;
        bytes[5] = 1; // little endian
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    #[test]
    fn classifies_x86_64() {
        let abi = parse_elf_header(&elf(2, 0x3e)).unwrap();
        assert_eq!(abi.architecture, "x86_64");
        assert_eq!(abi.pointer_width, 64);
    }

    #[test]
    fn classifies_32_bit_arm() {
        let abi = parse_elf_header(&elf(1, 0x28)).unwrap();
        assert_eq!(abi.architecture, "arm");
        assert_eq!(abi.pointer_width, 32);
    }

    #[test]
    fn rejects_non_elf() {
        assert_eq!(parse_elf_header(b"#!/bin/sh\n"), None);
        assert_eq!(parse_elf_header(&[]), None);
    }

    #[test]
    fn match_against_hint() {
        let detected = parse_elf_header(&elf(2, 0x3e)).unwrap();
        let good = AbiDescriptor::new("x86_64", BuildFlavor::Release, 5, 4);
        let bad = AbiDescriptor::new("aarch64", BuildFlavor::Release, 5, 4);
        assert!(detected.matches(&good));
        assert!(!detected.matches(&bad));
    }

    #[test]
    fn missing_process_is_not_found() {
        // PID 0 never has a /proc entry we can read as a regular process.
        let err = process_executable(u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            InjectionError::NotFound(_) | InjectionError::ToolUnavailable(_)
        ));
    }
}
