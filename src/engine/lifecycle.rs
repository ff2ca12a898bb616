//! Engine process lifecycle management.
//!
//! The supervisor drives `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`, with a terminal `Crashed` reached when a running engine
//! disappears without a supervisor-issued stop. Liveness is always
//! re-queried from the process table; the pid file is a hint, never a
//! source of truth.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::engine::process::{
    wait_for_exit, ProcessError, ProcessTable, SystemProcessTable, Termination,
};

const START_POLL_ATTEMPTS: u32 = 6;
const START_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STOP_POLL_ATTEMPTS: u32 = 20;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const KILL_POLL_ATTEMPTS: u32 = 8;

/// Settling delay between stop and start so the OS releases the
/// listening ports before the new process rebinds them.
const RESTART_SETTLE: Duration = Duration::from_secs(1);

/// Executable names the engine may run under in the process table.
pub const ENGINE_PROCESS_NAMES: &[&str] = &["mihomo", "clash"];

/// Errors that can occur during engine lifecycle management.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Start was attempted without its prerequisites; the message lists
    /// exactly which are missing.
    #[error("cannot start engine, missing: {0}")]
    Precondition(String),

    #[error("engine failed to launch: {0}")]
    LaunchFailed(String),

    #[error("process table error: {0}")]
    ProcessQuery(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// File paths used by the engine supervisor.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl EnginePaths {
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".config")
            .join("clash");
        Self::in_dir(config_dir)
    }

    /// Paths rooted at a custom directory.
    pub fn in_dir(config_dir: PathBuf) -> Self {
        Self {
            config_file: config_dir.join("config.yaml"),
            pid_file: config_dir.join("clash.pid"),
            log_file: config_dir.join("clash.log"),
            config_dir,
        }
    }
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The process disappeared without a supervisor-issued stop.
    Crashed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Crashed => "crashed",
        }
    }
}

/// Handle to a launched engine process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub state: ServiceState,
}

/// Reconciled view of the engine's state.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
}

/// Supervises one engine process.
///
/// An explicit value rather than ambient module state, so independent
/// supervisors can be built over fake process tables in tests.
pub struct Supervisor {
    binary_path: PathBuf,
    paths: EnginePaths,
    table: Box<dyn ProcessTable>,
    start_poll: (u32, Duration),
    stop_poll: (u32, Duration),
    settle: Duration,
}

impl Supervisor {
    /// Supervisor over the live OS process table.
    pub fn new(binary_path: PathBuf, paths: EnginePaths) -> Self {
        Self::with_table(binary_path, paths, Box::new(SystemProcessTable::new()))
    }

    /// Supervisor over a caller-provided process table.
    pub fn with_table(
        binary_path: PathBuf,
        paths: EnginePaths,
        table: Box<dyn ProcessTable>,
    ) -> Self {
        Self {
            binary_path,
            paths,
            table,
            start_poll: (START_POLL_ATTEMPTS, START_POLL_INTERVAL),
            stop_poll: (STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL),
            settle: RESTART_SETTLE,
        }
    }

    /// Start the engine.
    ///
    /// Idempotent: if the process table already shows a live engine, the
    /// existing handle is returned and nothing is spawned. Otherwise the
    /// binary is launched detached with output redirected to the log
    /// file, and presence is confirmed by a short poll loop.
    pub fn start(&mut self) -> Result<ProcessHandle> {
        if let Some(pid) = self.running_pid() {
            log::warn!("engine already running (pid {pid})");
            return Ok(self.handle(pid, ServiceState::Running));
        }

        let mut missing = Vec::new();
        if !self.binary_path.is_file() {
            missing.push(format!("binary {}", self.binary_path.display()));
        }
        if !self.paths.config_file.is_file() {
            missing.push(format!("config {}", self.paths.config_file.display()));
        }
        if !missing.is_empty() {
            return Err(LifecycleError::Precondition(missing.join(", ")));
        }

        fs::create_dir_all(&self.paths.config_dir)?;
        let log_file = File::create(&self.paths.log_file)?;

        log::info!(
            "starting engine: {} -f {}",
            self.binary_path.display(),
            self.paths.config_file.display()
        );

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-f")
            .arg(&self.paths.config_file)
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .stdin(Stdio::null());

        // Detach from our process group so the engine outlives this
        // invocation.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            LifecycleError::LaunchFailed(format!(
                "failed to spawn {}: {e}",
                self.binary_path.display()
            ))
        })?;
        let pid = child.id();
        drop(child);

        let (attempts, interval) = self.start_poll;
        for _ in 0..attempts {
            thread::sleep(interval);
            if !self.table.alive(pid) {
                return Err(LifecycleError::LaunchFailed(format!(
                    "engine exited during startup; check {}",
                    self.paths.log_file.display()
                )));
            }
        }

        self.write_pid_file(pid)?;
        log::info!("engine running (pid {pid})");
        Ok(self.handle(pid, ServiceState::Running))
    }

    /// Stop the engine.
    ///
    /// Already stopped is a no-op success, and so is a handle gone stale
    /// because the process died on its own. A graceful signal is tried
    /// first; if the process is still present after the bounded wait it
    /// is killed outright.
    pub fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.running_pid() else {
            self.clear_pid_file();
            log::info!("engine not running");
            return Ok(());
        };

        log::info!("stopping engine (pid {pid})");
        self.table.terminate(pid, Termination::Graceful)?;

        let (attempts, interval) = self.stop_poll;
        if !wait_for_exit(self.table.as_mut(), pid, attempts, interval) {
            log::warn!("engine did not exit after graceful signal; killing pid {pid}");
            self.table.terminate(pid, Termination::Forceful)?;
            wait_for_exit(self.table.as_mut(), pid, KILL_POLL_ATTEMPTS, interval);
        }

        self.clear_pid_file();
        log::info!("engine stopped");
        Ok(())
    }

    /// Stop, wait for the ports to be released, then start.
    ///
    /// A start failure after a successful stop leaves the system
    /// stopped, never partially running.
    pub fn restart(&mut self) -> Result<ProcessHandle> {
        self.stop()?;
        thread::sleep(self.settle);
        self.start()
    }

    /// Read-only reconciliation against the process table.
    ///
    /// A pid-file entry is only trusted when the table confirms a live
    /// engine process behind it; a recorded pid with no live process
    /// means the engine crashed.
    pub fn status(&mut self) -> ServiceStatus {
        if let Some(pid) = self.running_pid() {
            return ServiceStatus {
                state: ServiceState::Running,
                pid: Some(pid),
            };
        }

        if self.read_pid_file().is_some() {
            return ServiceStatus {
                state: ServiceState::Crashed,
                pid: None,
            };
        }

        ServiceStatus {
            state: ServiceState::Stopped,
            pid: None,
        }
    }

    /// Config file path this supervisor launches the engine with.
    pub fn config_path(&self) -> &Path {
        &self.paths.config_file
    }

    fn handle(&self, pid: u32, state: ServiceState) -> ProcessHandle {
        ProcessHandle {
            pid,
            binary_path: self.binary_path.clone(),
            config_path: self.paths.config_file.clone(),
            log_path: self.paths.log_file.clone(),
            state,
        }
    }

    /// PID of the live engine process, if any. The pid file is verified
    /// against the table; otherwise the table is scanned by name.
    fn running_pid(&mut self) -> Option<u32> {
        if let Some(pid) = self.read_pid_file() {
            if self.table.alive(pid)
                && self.table.find_by_name(ENGINE_PROCESS_NAMES).contains(&pid)
            {
                return Some(pid);
            }
        }

        self.table
            .find_by_name(ENGINE_PROCESS_NAMES)
            .into_iter()
            .next()
    }

    fn read_pid_file(&self) -> Option<u32> {
        fs::read_to_string(&self.paths.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&pid: &u32| pid > 0)
    }

    fn write_pid_file(&self, pid: u32) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)?;
        fs::write(&self.paths.pid_file, format!("{pid}\n"))?;
        Ok(())
    }

    fn clear_pid_file(&self) {
        let _ = fs::remove_file(&self.paths.pid_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use std::sync::{Arc, Mutex};

    /// In-memory process table recording every signal it delivers.
    struct FakeProcessTable {
        procs: HashMap<u32, String>,
        graceful_effective: bool,
        signals: Arc<Mutex<Vec<(u32, Termination)>>>,
    }

    impl FakeProcessTable {
        fn empty() -> Self {
            Self {
                procs: HashMap::new(),
                graceful_effective: true,
                signals: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_engine(pid: u32) -> Self {
            let mut table = Self::empty();
            table.procs.insert(pid, "mihomo".to_string());
            table
        }

        fn signal_log(&self) -> Arc<Mutex<Vec<(u32, Termination)>>> {
            Arc::clone(&self.signals)
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn alive(&mut self, pid: u32) -> bool {
            self.procs.contains_key(&pid)
        }

        fn find_by_name(&mut self, patterns: &[&str]) -> Vec<u32> {
            let mut pids: Vec<u32> = self
                .procs
                .iter()
                .filter(|(_, name)| patterns.iter().any(|p| name.contains(p)))
                .map(|(&pid, _)| pid)
                .collect();
            pids.sort_unstable();
            pids
        }

        fn terminate(&mut self, pid: u32, how: Termination) -> std::result::Result<(), ProcessError> {
            self.signals.lock().unwrap().push((pid, how));
            match how {
                Termination::Graceful => {
                    if self.graceful_effective {
                        self.procs.remove(&pid);
                    }
                }
                Termination::Forceful => {
                    self.procs.remove(&pid);
                }
            }
            Ok(())
        }
    }

    fn test_supervisor(dir: &Path, table: FakeProcessTable, binary: PathBuf) -> Supervisor {
        let mut supervisor = Supervisor::with_table(
            binary,
            EnginePaths::in_dir(dir.to_path_buf()),
            Box::new(table),
        );
        supervisor.start_poll = (2, Duration::from_millis(5));
        supervisor.stop_poll = (2, Duration::from_millis(5));
        supervisor.settle = Duration::from_millis(5);
        supervisor
    }

    #[test]
    fn test_start_is_idempotent_when_running() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with_engine(4242);
        // Deliberately bogus binary path: a second spawn would fail loudly.
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("missing-binary"));

        let first = supervisor.start().unwrap();
        let second = supervisor.start().unwrap();
        assert_eq!(first.pid, 4242);
        assert_eq!(second.pid, first.pid);
        assert_eq!(second.state, ServiceState::Running);
    }

    #[test]
    fn test_start_lists_missing_prerequisites() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = test_supervisor(
            dir.path(),
            FakeProcessTable::empty(),
            dir.path().join("missing-binary"),
        );

        let err = supervisor.start().unwrap_err();
        match err {
            LifecycleError::Precondition(missing) => {
                assert!(missing.contains("binary"));
                assert!(missing.contains("config"));
            }
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_start_fails_when_process_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "port: 7890\n").unwrap();

        // /bin/true exits immediately and the empty fake table never
        // reports it alive, so the launch poll must fail.
        let mut supervisor = test_supervisor(
            dir.path(),
            FakeProcessTable::empty(),
            PathBuf::from("/bin/true"),
        );

        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, LifecycleError::LaunchFailed(_)));
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
    }

    #[test]
    fn test_stop_is_noop_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::empty();
        let signals = table.signal_log();
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("mihomo"));

        supervisor.stop().unwrap();
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
        assert!(signals.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_sends_only_graceful_signal_when_it_works() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with_engine(777);
        let signals = table.signal_log();
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("mihomo"));

        supervisor.stop().unwrap();
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
        assert_eq!(*signals.lock().unwrap(), vec![(777, Termination::Graceful)]);
    }

    #[test]
    fn test_stop_escalates_to_forceful_kill() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FakeProcessTable::with_engine(777);
        table.graceful_effective = false;
        let signals = table.signal_log();
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("mihomo"));

        supervisor.stop().unwrap();
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
        assert_eq!(
            *signals.lock().unwrap(),
            vec![(777, Termination::Graceful), (777, Termination::Forceful)]
        );
    }

    #[test]
    fn test_stop_tolerates_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = test_supervisor(
            dir.path(),
            FakeProcessTable::empty(),
            dir.path().join("mihomo"),
        );
        supervisor.write_pid_file(555).unwrap();

        // The recorded process died on its own; detecting absence is
        // success, and the stale record is cleaned up.
        supervisor.stop().unwrap();
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
    }

    #[test]
    fn test_restart_failure_after_stop_leaves_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with_engine(777);
        // Stop succeeds, then start fails its precondition check; the
        // system must end up stopped, not partially running.
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("missing-binary"));

        let err = supervisor.restart().unwrap_err();
        assert!(matches!(err, LifecycleError::Precondition(_)));
        assert_eq!(supervisor.status().state, ServiceState::Stopped);
    }

    #[test]
    fn test_status_reports_crash_for_dead_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = test_supervisor(
            dir.path(),
            FakeProcessTable::empty(),
            dir.path().join("mihomo"),
        );
        supervisor.write_pid_file(4242).unwrap();

        let status = supervisor.status();
        assert_eq!(status.state, ServiceState::Crashed);
        assert_eq!(status.pid, None);
    }

    #[test]
    fn test_status_ignores_pid_file_not_matching_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FakeProcessTable::empty();
        // The recorded pid was reused by an unrelated process.
        table.procs.insert(555, "some-editor".to_string());
        table.procs.insert(900, "mihomo".to_string());
        let mut supervisor = test_supervisor(dir.path(), table, dir.path().join("mihomo"));
        supervisor.write_pid_file(555).unwrap();

        let status = supervisor.status();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.pid, Some(900));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ServiceState::Running.as_str(), "running");
        assert_eq!(ServiceState::Crashed.as_str(), "crashed");
    }
}
