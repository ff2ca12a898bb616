//! Host platform detection and release-asset mapping.
//!
//! Pure functions only: the resolver inspects OS and machine strings and
//! maps them to the identifiers used in upstream release artifacts. It
//! never touches the network or the filesystem.

use thiserror::Error;

/// Errors produced while resolving the host platform.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("unsupported platform: {os}/{arch}")]
    Unsupported { os: String, arch: String },
}

/// Operating systems with published engine release artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Macos,
    Windows,
}

impl TargetOs {
    /// Token used in upstream asset file names.
    pub fn asset_token(&self) -> &'static str {
        match self {
            TargetOs::Linux => "linux",
            TargetOs::Macos => "darwin",
            TargetOs::Windows => "windows",
        }
    }

    /// Executable file suffix on this OS.
    pub fn exe_suffix(&self) -> &'static str {
        match self {
            TargetOs::Windows => ".exe",
            _ => "",
        }
    }
}

/// Machine architectures with published engine release artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    Amd64,
    Arm64,
    Armv7,
}

impl TargetArch {
    /// Token used in upstream asset file names.
    pub fn asset_token(&self) -> &'static str {
        match self {
            TargetArch::Amd64 => "amd64",
            TargetArch::Arm64 => "arm64",
            TargetArch::Armv7 => "armv7",
        }
    }
}

/// Archive container the release asset ships in.
///
/// Dispatched exactly once, at install time: gzip assets hold the raw
/// binary, zip assets hold a named entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    GzipRaw,
    Zip,
}

impl ArchiveFormat {
    /// File extension of the archive.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::GzipRaw => "gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// The release artifact matching one host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTarget {
    pub os: TargetOs,
    pub arch: TargetArch,
    pub format: ArchiveFormat,
}

impl ReleaseTarget {
    /// Resolve the release target for the running host.
    pub fn detect() -> Result<Self, PlatformError> {
        Self::resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Resolve a release target from free-form OS and machine strings.
    ///
    /// Accepts the synonyms vendors actually report (`x86_64`/`amd64`,
    /// `aarch64`/`arm64`, `armv7l`, `Darwin`, ...).
    pub fn resolve(os: &str, arch: &str) -> Result<Self, PlatformError> {
        let unsupported = || PlatformError::Unsupported {
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let target_os = match os.to_ascii_lowercase().as_str() {
            "linux" => TargetOs::Linux,
            "macos" | "darwin" => TargetOs::Macos,
            "windows" => TargetOs::Windows,
            _ => return Err(unsupported()),
        };

        let target_arch = match arch.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => TargetArch::Amd64,
            "aarch64" | "arm64" => TargetArch::Arm64,
            a if a.starts_with("armv7") => TargetArch::Armv7,
            _ => return Err(unsupported()),
        };

        // armv7 builds only exist for linux
        if target_arch == TargetArch::Armv7 && target_os != TargetOs::Linux {
            return Err(unsupported());
        }

        let format = match target_os {
            TargetOs::Windows => ArchiveFormat::Zip,
            _ => ArchiveFormat::GzipRaw,
        };

        Ok(ReleaseTarget {
            os: target_os,
            arch: target_arch,
            format,
        })
    }
}
