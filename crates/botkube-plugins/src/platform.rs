//! `os/arch` platform selector for index URLs.

use std::fmt;

/// Operating system and architecture, using the names found in plugin
/// indexes (`linux/amd64`, `darwin/arm64`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    /// Operating system (`linux`, `darwin`, `windows`).
    pub os: String,
    /// CPU architecture (`amd64`, `arm64`, ...).
    pub arch: String,
}

impl Platform {
    /// Create a platform from index-style names.
    #[must_use]
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform the agent is running on.
    #[must_use]
    pub fn current() -> Self {
        Self::from_rust(
            std::env::consts::OS,
            std::env::consts::ARCH,
            cfg!(target_endian = "little"),
        )
    }

    /// Map Rust target names to index names.
    ///
    /// `little_endian` picks between the two index names that share one Rust
    /// architecture name (`ppc64`/`ppc64le`).
    #[must_use]
    pub fn from_rust(os: &str, arch: &str, little_endian: bool) -> Self {
        let os = match os {
            "macos" => "darwin",
            other => other,
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" if little_endian => "ppc64le",
            "powerpc64" => "ppc64",
            other => other,
        };
        Self::new(os, arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}
