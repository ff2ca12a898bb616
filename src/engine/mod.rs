//! Engine binary management and supervision.
//!
//! This module provides:
//! - Release download and installation (`install`)
//! - Process lifecycle management (`lifecycle`)
//! - Portable process-table access (`process`)

pub mod install;
pub mod lifecycle;
pub mod process;

pub use install::{InstalledBinary, Installer};
pub use lifecycle::Supervisor;
