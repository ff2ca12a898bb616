//! Portable process-table access.
//!
//! Lifecycle code never trusts cached handles: every liveness question is
//! answered by re-querying the OS process table through the
//! [`ProcessTable`] trait. The sysinfo-backed implementation covers all
//! supported hosts; tests substitute their own tables.

use std::thread;
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;

/// Errors from process-table queries and signalling.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// How to terminate a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Termination signal the process may handle and exit cleanly on
    Graceful,
    /// Unconditional kill
    Forceful,
}

/// Read and signal the OS process table.
pub trait ProcessTable {
    /// Whether `pid` exists and is not a zombie. Re-reads the table.
    fn alive(&mut self, pid: u32) -> bool;

    /// PIDs of live processes whose executable name contains any of the
    /// given patterns, ascending.
    fn find_by_name(&mut self, patterns: &[&str]) -> Vec<u32>;

    /// Terminate `pid`. A process that is already gone counts as success.
    fn terminate(&mut self, pid: u32, how: Termination) -> Result<(), ProcessError>;
}

/// [`ProcessTable`] backed by the live OS process table.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    fn defunct(status: ProcessStatus) -> bool {
        matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn alive(&mut self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        self.refresh();
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => !Self::defunct(process.status()),
            None => false,
        }
    }

    fn find_by_name(&mut self, patterns: &[&str]) -> Vec<u32> {
        self.refresh();
        let mut pids: Vec<u32> = self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| !Self::defunct(process.status()))
            .filter(|(_, process)| {
                let name = process.name().to_string_lossy().to_lowercase();
                patterns.iter().any(|pattern| name.contains(pattern))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn terminate(&mut self, pid: u32, how: Termination) -> Result<(), ProcessError> {
        self.refresh();

        let delivered = {
            let Some(process) = self.system.process(Pid::from_u32(pid)) else {
                return Ok(());
            };
            match how {
                // Fall back to a hard kill where the platform has no
                // termination signal to deliver.
                Termination::Graceful => process
                    .kill_with(Signal::Term)
                    .unwrap_or_else(|| process.kill()),
                Termination::Forceful => process.kill(),
            }
        };

        if delivered {
            return Ok(());
        }

        // The signal may have failed because the process exited between
        // the refresh and the kill; absence is success.
        self.refresh();
        if self.system.process(Pid::from_u32(pid)).is_none() {
            Ok(())
        } else {
            Err(ProcessError::Signal {
                pid,
                reason: "signal not delivered".to_string(),
            })
        }
    }
}

/// Poll until `pid` leaves the process table, bounded by
/// `attempts * interval`. Returns true once the process is gone.
pub fn wait_for_exit(
    table: &mut dyn ProcessTable,
    pid: u32,
    attempts: u32,
    interval: Duration,
) -> bool {
    for _ in 0..attempts {
        if !table.alive(pid) {
            return true;
        }
        thread::sleep(interval);
    }
    !table.alive(pid)
}
