//! Binary compatibility descriptors for introspection targets.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Build flavor of the target binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFlavor {
    Debug,
    Release,
}

impl BuildFlavor {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

/// ABI parse error.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a valid ABI id: {0}")]
pub struct AbiParseError(pub String);

/// Compatibility fingerprint of a target process.
///
/// Immutable once detected. An agent payload built for descriptor A may be
/// loaded into a target with descriptor B only if [`AbiDescriptor::is_compatible`]
/// holds; both injection and the connection handshake check this before
/// doing anything irreversible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbiDescriptor {
    /// Processor architecture, e.g. `x86_64` or `aarch64`.
    pub architecture: String,
    /// Pointer width in bits.
    pub pointer_width: u8,
    /// Debug or release build.
    pub flavor: BuildFlavor,
    /// Major version of the reflected toolkit inside the target.
    pub toolkit_major: u16,
    /// Minor version of the reflected toolkit inside the target.
    pub toolkit_minor: u16,
}

impl AbiDescriptor {
    /// Create a descriptor for the given architecture and toolkit version.
    #[must_use]
    pub fn new(
        architecture: impl Into<String>,
        flavor: BuildFlavor,
        toolkit_major: u16,
        toolkit_minor: u16,
    ) -> Self {
        let architecture = architecture.into();
        let pointer_width = pointer_width_for(&architecture);
        Self {
            architecture,
            pointer_width,
            flavor,
            toolkit_major,
            toolkit_minor,
        }
    }

    /// Whether all fields are filled in.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.architecture.is_empty() && self.pointer_width != 0
    }

    /// Whether a payload with this descriptor can be loaded into `target`.
    ///
    /// An older payload minor version is fine since the target defines the
    /// toolkit libraries actually being used; everything else must match.
    #[must_use]
    pub fn is_compatible(&self, target: &Self) -> bool {
        self.toolkit_major == target.toolkit_major
            && self.toolkit_minor <= target.toolkit_minor
            && self.architecture == target.architecture
            && self.pointer_width == target.pointer_width
            && self.flavor == target.flavor
    }

    /// Compact id, e.g. `tk5.4-x86_64-release`.
    ///
    /// Used as probe directory name and in discovery beacons. Round-trips
    /// through [`FromStr`].
    #[must_use]
    pub fn id(&self) -> String {
        format!(
            "tk{}.{}-{}-{}",
            self.toolkit_major,
            self.toolkit_minor,
            self.architecture,
            self.flavor.as_str()
        )
    }
}

impl fmt::Display for AbiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toolkit {}.{} ({}, {}-bit, {})",
            self.toolkit_major,
            self.toolkit_minor,
            self.architecture,
            self.pointer_width,
            self.flavor.as_str()
        )
    }
}

impl FromStr for AbiDescriptor {
    type Err = AbiParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AbiParseError(s.to_string());

        let rest = s.strip_prefix("tk").ok_or_else(err)?;
        let (version, rest) = rest.split_once('-').ok_or_else(err)?;
        let (major, minor) = version.split_once('.').ok_or_else(err)?;
        let (arch, flavor) = rest.rsplit_once('-').ok_or_else(err)?;

        let flavor = match flavor {
            "debug" => BuildFlavor::Debug,
            "release" => BuildFlavor::Release,
            _ => return Err(err()),
        };
        if arch.is_empty() {
            return Err(err());
        }

        Ok(Self::new(
            arch,
            flavor,
            major.parse().map_err(|_| err())?,
            minor.parse().map_err(|_| err())?,
        ))
    }
}

fn pointer_width_for(architecture: &str) -> u8 {
    match architecture {
        "i686" | "arm" => 32,
        "" => 0,
        _ => 64,
    }
}
