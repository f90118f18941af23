/*!
 * Configuration
 * Supervisor and per-worker settings with serde support
 *
 * Durations are serialized as integer milliseconds. Every field has a default,
 * so a partial JSON document is a valid configuration.
 *
 * Environment variables (applied by `OrchestratorConfig::from_env`):
 * - ORCHESTRATOR_CONFIG: path to a JSON config file
 * - ORCHESTRATOR_IPC_ROOT: mailbox root directory
 * - ORCHESTRATOR_MAX_WORKERS: fleet size ceiling
 * - ORCHESTRATOR_WORKER_PROGRAM: worker executable
 */

use super::errors::OrchestratorError;
use super::limits;
use super::types::{Priority, ProcessId};
use crate::monitoring::AlertThresholds;
use crate::process::types::ProcessState;
use crate::resources::{AllocationStrategy, ResourceLimits};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when a worker stops on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Relaunch on failure and on clean exit
    Always,
    /// Never relaunch automatically
    Never,
    /// Relaunch only after a failure
    #[default]
    OnFailure,
}

impl RestartPolicy {
    #[inline]
    pub fn recovers_failures(self) -> bool {
        !matches!(self, RestartPolicy::Never)
    }

    #[inline]
    pub fn restarts_clean_exit(self) -> bool {
        matches!(self, RestartPolicy::Always)
    }
}

/// Opaque worker credentials
///
/// Values never appear in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Per-worker configuration supplied before `create`
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: ProcessId,
    pub priority: Priority,
    pub credentials: Credentials,
    /// Overrides the priority-derived default budget
    pub resource_limits: Option<ResourceLimits>,
    pub restart_policy: RestartPolicy,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub startup_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_check_interval: Duration,
    /// Free-form settings forwarded to the worker untouched
    pub settings: serde_json::Value,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<ProcessId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Serialize into the blob passed on the worker command line
    pub fn to_blob(&self) -> Result<String, OrchestratorError> {
        serde_json::to_string(self).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    pub fn from_blob(blob: &str) -> Result<Self, OrchestratorError> {
        serde_json::from_str(blob).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.worker_id.trim().is_empty() {
            return Err(OrchestratorError::Config("worker_id must not be empty".into()));
        }
        if self.worker_id == limits::SUPERVISOR_CHANNEL {
            return Err(OrchestratorError::Config(format!(
                "worker_id '{}' is reserved",
                limits::SUPERVISOR_CHANNEL
            )));
        }
        if self.worker_id.contains(|c| c == '/' || c == '\\') || self.worker_id.contains("..") {
            return Err(OrchestratorError::Config(
                "worker_id must not contain path separators".into(),
            ));
        }
        require_positive("startup_timeout", self.startup_timeout)?;
        require_positive("health_check_interval", self.health_check_interval)?;
        if let Some(limits) = &self.resource_limits {
            limits.validate().map_err(|reason| {
                OrchestratorError::Config(format!("resource_limits of {}: {}", self.worker_id, reason))
            })?;
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            priority: Priority::Normal,
            credentials: Credentials::default(),
            resource_limits: None,
            restart_policy: RestartPolicy::OnFailure,
            startup_timeout: limits::STARTUP_TIMEOUT,
            health_check_interval: limits::MONITOR_INTERVAL,
            settings: serde_json::Value::Null,
        }
    }
}

/// Automated recovery settings
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Delay before attempt N; the last entry repeats
    #[serde_as(as = "Vec<DurationMilliSeconds<u64>>")]
    pub backoff: Vec<Duration>,
}

impl RecoveryConfig {
    /// Backoff before the given (0-indexed) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff.len() {
            0 => Duration::ZERO,
            len => self.backoff[(attempt as usize).min(len - 1)],
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: limits::MAX_RECOVERY_ATTEMPTS,
            backoff: limits::RECOVERY_BACKOFF.to_vec(),
        }
    }
}

/// Maximum dwell time per transitional state
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateTimeouts {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub starting: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stopping: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub pausing: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resuming: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub restarting: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovering: Duration,
}

impl StateTimeouts {
    pub fn for_state(&self, state: ProcessState) -> Option<Duration> {
        match state {
            ProcessState::Starting => Some(self.starting),
            ProcessState::Stopping => Some(self.stopping),
            ProcessState::Pausing => Some(self.pausing),
            ProcessState::Resuming => Some(self.resuming),
            ProcessState::Restarting => Some(self.restarting),
            ProcessState::Recovering => Some(self.recovering),
            _ => None,
        }
    }
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            starting: limits::STARTING_TIMEOUT,
            stopping: limits::STOPPING_TIMEOUT,
            pausing: limits::PAUSING_TIMEOUT,
            resuming: limits::RESUMING_TIMEOUT,
            restarting: limits::RESTARTING_TIMEOUT,
            recovering: limits::RECOVERING_TIMEOUT,
        }
    }
}

/// IPC loop settings
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpcConfig {
    pub root: PathBuf,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delivery_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cleanup_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_timeout: Duration,
}

impl IpcConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("bot-orchestrator-ipc"),
            delivery_interval: limits::DELIVERY_INTERVAL,
            heartbeat_interval: limits::HEARTBEAT_INTERVAL,
            idle_timeout: limits::CHANNEL_IDLE_TIMEOUT,
            cleanup_interval: limits::CHANNEL_CLEANUP_INTERVAL,
            default_timeout: limits::DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

/// Top-level supervisor configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub ipc: IpcConfig,
    pub max_workers: usize,
    pub max_total_memory_mb: f64,
    pub max_total_cpu_percent: f64,
    /// Global ceiling the allocator admits against
    pub system_capacity: ResourceLimits,
    /// Baseline budget for a Normal-priority worker
    pub default_limits: ResourceLimits,
    pub allocation_strategy: AllocationStrategy,
    pub worker_program: PathBuf,
    /// Arguments placed before `<worker_id> <config_json> <ipc_root>`
    pub worker_args: Vec<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub monitor_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub optimize_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_timeout: Duration,
    pub recovery: RecoveryConfig,
    pub state_timeouts: StateTimeouts,
    pub alert_thresholds: AlertThresholds,
    /// Workers created at supervisor startup
    pub workers: Vec<WorkerConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ipc: IpcConfig::default(),
            max_workers: limits::MAX_WORKERS,
            max_total_memory_mb: 8192.0,
            max_total_cpu_percent: 400.0,
            system_capacity: ResourceLimits::system_default(),
            default_limits: ResourceLimits::default(),
            allocation_strategy: AllocationStrategy::Adaptive,
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            monitor_interval: limits::MONITOR_INTERVAL,
            optimize_interval: limits::OPTIMIZE_INTERVAL,
            stop_timeout: limits::STOP_TIMEOUT,
            shutdown_timeout: limits::SHUTDOWN_TIMEOUT,
            recovery: RecoveryConfig::default(),
            state_timeouts: StateTimeouts::default(),
            alert_thresholds: AlertThresholds::default(),
            workers: Vec::new(),
        }
    }
}

fn require_positive(name: &str, value: Duration) -> Result<(), OrchestratorError> {
    if value.is_zero() {
        return Err(OrchestratorError::Config(format!("{} must be positive", name)));
    }
    Ok(())
}

/// The `worker` binary next to the running executable
fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("worker")))
        .unwrap_or_else(|| PathBuf::from("worker"))
}

impl OrchestratorConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the optional config file, then individual overrides
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let mut config = match std::env::var("ORCHESTRATOR_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(root) = std::env::var("ORCHESTRATOR_IPC_ROOT") {
            config.ipc.root = PathBuf::from(root);
        }
        if let Ok(max) = std::env::var("ORCHESTRATOR_MAX_WORKERS") {
            config.max_workers = max.parse().map_err(|_| {
                OrchestratorError::Config(format!("ORCHESTRATOR_MAX_WORKERS: not a number: {}", max))
            })?;
        }
        if let Ok(program) = std::env::var("ORCHESTRATOR_WORKER_PROGRAM") {
            config.worker_program = PathBuf::from(program);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_workers == 0 {
            return Err(OrchestratorError::Config("max_workers must be positive".into()));
        }
        if self.max_total_memory_mb <= 0.0 || self.max_total_cpu_percent <= 0.0 {
            return Err(OrchestratorError::Config(
                "fleet memory and CPU ceilings must be positive".into(),
            ));
        }
        if !self.max_total_memory_mb.is_finite() || !self.max_total_cpu_percent.is_finite() {
            return Err(OrchestratorError::Config(
                "fleet memory and CPU ceilings must be finite".into(),
            ));
        }
        if self.system_capacity.first_invalid().is_some() || !self.system_capacity.is_positive() {
            return Err(OrchestratorError::Config(
                "system_capacity must be positive and finite in every dimension".into(),
            ));
        }
        self.default_limits
            .validate()
            .map_err(|reason| OrchestratorError::Config(format!("default_limits: {}", reason)))?;

        for (name, value) in [
            ("monitor_interval", self.monitor_interval),
            ("optimize_interval", self.optimize_interval),
            ("stop_timeout", self.stop_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("ipc.delivery_interval", self.ipc.delivery_interval),
            ("ipc.heartbeat_interval", self.ipc.heartbeat_interval),
            ("ipc.idle_timeout", self.ipc.idle_timeout),
            ("ipc.cleanup_interval", self.ipc.cleanup_interval),
            ("ipc.default_timeout", self.ipc.default_timeout),
            ("state_timeouts.starting", self.state_timeouts.starting),
            ("state_timeouts.stopping", self.state_timeouts.stopping),
            ("state_timeouts.pausing", self.state_timeouts.pausing),
            ("state_timeouts.resuming", self.state_timeouts.resuming),
            ("state_timeouts.restarting", self.state_timeouts.restarting),
            ("state_timeouts.recovering", self.state_timeouts.recovering),
        ] {
            require_positive(name, value)?;
        }
        for worker in &self.workers {
            worker.validate()?;
        }
        Ok(())
    }
}
