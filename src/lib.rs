//! clashman - installer and process supervisor for the mihomo proxy engine.
//!
//! The crate resolves the release artifact for the host platform,
//! installs the engine binary, synthesizes and mutates its YAML routing
//! configuration, drives the process through start/stop/restart, and
//! verifies the resulting service with independent health probes.

pub mod config;
pub mod engine;
pub mod error;
pub mod platform;
pub mod probe;

pub use error::{Error, Result};

pub use config::model::{
    DnsConfig, EngineConfig, ProxyGroup, ProxyServer, DIRECT, SELECTION_GROUP,
};
pub use config::ConfigError;

pub use engine::install::{InstallError, InstalledBinary, Installer};
pub use engine::lifecycle::{
    EnginePaths, LifecycleError, ProcessHandle, ServiceState, ServiceStatus, Supervisor,
};
pub use engine::process::{ProcessTable, SystemProcessTable, Termination};

pub use platform::{ArchiveFormat, PlatformError, ReleaseTarget, TargetArch, TargetOs};

pub use probe::{ProbeResult, ProbeTarget, Prober};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
