//! Error types for clashman.

use thiserror::Error;

/// Top-level error type aggregating every subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// Host platform has no known release artifact
    #[error("platform error: {0}")]
    Platform(#[from] crate::platform::PlatformError),

    /// Release lookup, download, or installation failure
    #[error("install error: {0}")]
    Install(#[from] crate::engine::install::InstallError),

    /// Configuration parsing or mutation failure
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Process lifecycle failure
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] crate::engine::lifecycle::LifecycleError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for clashman operations.
pub type Result<T> = std::result::Result<T, Error>;
