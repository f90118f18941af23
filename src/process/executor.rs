/*!
 * Process Executor
 * OS-level spawning, signalling and reaping of worker processes
 */

use crate::core::errors::OrchestratorError;
use crate::core::types::ProcessId;
use ahash::RandomState;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal as UnixSignal};
#[cfg(unix)]
use nix::unistd::Pid as NixPid;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How to launch one worker process
#[derive(Debug, Clone, Default)]
pub struct ExecutionConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env_vars: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub capture_output: bool,
}

impl ExecutionConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Signals the executor can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
    Stop,
    Continue,
}

#[cfg(unix)]
impl From<ProcessSignal> for UnixSignal {
    fn from(signal: ProcessSignal) -> Self {
        match signal {
            ProcessSignal::Terminate => UnixSignal::SIGTERM,
            ProcessSignal::Kill => UnixSignal::SIGKILL,
            ProcessSignal::Stop => UnixSignal::SIGSTOP,
            ProcessSignal::Continue => UnixSignal::SIGCONT,
        }
    }
}

/// Running (or exited, not yet removed) worker process
#[derive(Debug)]
pub struct WorkerProcess {
    pub process_id: ProcessId,
    pub os_pid: u32,
    pub program: PathBuf,
    pub spawned_at: Instant,
    child: Child,
    exit: Option<ExitStatus>,
}

impl WorkerProcess {
    /// Exit status if the process has exited; reaps it without blocking
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(status),
                Ok(None) => {}
                Err(e) => warn!(process_id = %self.process_id, error = %e, "try_wait failed"),
            }
        }
        self.exit
    }
}

/// Owns the OS processes of all workers
pub struct ProcessExecutor {
    processes: DashMap<ProcessId, WorkerProcess, RandomState>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        info!("Process executor initialized");
        Self {
            processes: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Launch the OS process for `process_id`; returns its OS pid
    ///
    /// An exited process under the same id is replaced. A live one is an error.
    pub fn spawn(&self, process_id: &str, config: &ExecutionConfig) -> Result<u32, OrchestratorError> {
        if self.is_alive(process_id) {
            return Err(OrchestratorError::SpawnFailed {
                process_id: process_id.to_string(),
                reason: "process is already running".into(),
            });
        }

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }
        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }
        if config.capture_output {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| OrchestratorError::SpawnFailed {
            process_id: process_id.to_string(),
            reason: format!("{}: {}", config.program.display(), e),
        })?;

        let os_pid = child.id().ok_or_else(|| OrchestratorError::SpawnFailed {
            process_id: process_id.to_string(),
            reason: "process exited before its pid was read".into(),
        })?;

        info!(process_id = %process_id, os_pid, program = %config.program.display(), "Spawned worker process");

        self.processes.insert(
            process_id.to_string(),
            WorkerProcess {
                process_id: process_id.to_string(),
                os_pid,
                program: config.program.clone(),
                spawned_at: Instant::now(),
                child,
                exit: None,
            },
        );
        Ok(os_pid)
    }

    pub fn os_pid(&self, process_id: &str) -> Option<u32> {
        self.processes.get(process_id).map(|p| p.os_pid)
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.processes.contains_key(process_id)
    }

    /// Exit status if the process has exited
    pub fn exit_status(&self, process_id: &str) -> Option<ExitStatus> {
        self.processes
            .get_mut(process_id)
            .and_then(|mut p| p.poll_exit())
    }

    pub fn is_alive(&self, process_id: &str) -> bool {
        self.processes
            .get_mut(process_id)
            .is_some_and(|mut p| p.poll_exit().is_none())
    }

    /// Deliver `signal`; returns false when there is no live process
    pub fn signal(&self, process_id: &str, signal: ProcessSignal) -> bool {
        let Some(mut process) = self.processes.get_mut(process_id) else {
            return false;
        };
        if process.poll_exit().is_some() {
            return false;
        }

        #[cfg(unix)]
        {
            match kill(NixPid::from_raw(process.os_pid as i32), UnixSignal::from(signal)) {
                Ok(()) => {
                    debug!(process_id = %process_id, os_pid = process.os_pid, signal = ?signal, "Signal sent");
                    true
                }
                Err(e) => {
                    warn!(process_id = %process_id, os_pid = process.os_pid, signal = ?signal, error = %e, "Signal failed");
                    false
                }
            }
        }

        #[cfg(not(unix))]
        {
            match signal {
                ProcessSignal::Terminate | ProcessSignal::Kill => process.child.start_kill().is_ok(),
                ProcessSignal::Stop | ProcessSignal::Continue => false,
            }
        }
    }

    pub fn terminate(&self, process_id: &str) -> bool {
        self.signal(process_id, ProcessSignal::Terminate)
    }

    pub fn kill(&self, process_id: &str) -> bool {
        self.signal(process_id, ProcessSignal::Kill)
    }

    /// Wait up to `timeout` for the process to exit; true once it has
    pub async fn wait_for_exit(&self, process_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.processes.get_mut(process_id) {
                None => return true,
                Some(mut process) => {
                    if process.poll_exit().is_some() {
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    /// Forget the process, killing it first if it is still alive
    pub fn remove(&self, process_id: &str) -> Option<ExitStatus> {
        let (_, mut process) = self.processes.remove(process_id)?;
        if process.poll_exit().is_none() {
            if let Err(e) = process.child.start_kill() {
                debug!(process_id = %process_id, error = %e, "start_kill failed");
            }
        }
        process.exit
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
