/*!
 * Orchestrator Types
 * Worker views, fleet statistics and the configuration seam
 */

use crate::core::config::{RestartPolicy, WorkerConfig};
use crate::core::types::{Priority, ProcessId, Timestamp};
use crate::ipc::IpcStats;
use crate::monitoring::MetricsSnapshot;
use crate::process::{HealthInfo, LifecycleStats, ProcessState};
use crate::resources::{AllocatorStats, ResourceAllocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Materializes the effective configuration of a worker right before it starts
///
/// The supervisor only ever holds the returned value in memory.
pub trait ConfigSource: Send + Sync {
    fn materialize(&self, worker_id: &str, base: &WorkerConfig) -> anyhow::Result<WorkerConfig>;
}

/// Uses the configuration given to `create` unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticConfigSource;

impl ConfigSource for StaticConfigSource {
    fn materialize(&self, _worker_id: &str, base: &WorkerConfig) -> anyhow::Result<WorkerConfig> {
        Ok(base.clone())
    }
}

/// How a stop sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// No OS process was running
    NotRunning,
    /// Exited after the SHUTDOWN request
    Graceful,
    /// Exited after the terminate signal
    Terminated,
    /// Exited after the kill signal
    Killed,
    /// Still present after the kill signal
    Unconfirmed,
}

impl StopOutcome {
    pub fn exited(self) -> bool {
        !matches!(self, StopOutcome::Unconfirmed)
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub worker_id: ProcessId,
    pub state: ProcessState,
    pub os_pid: Option<u32>,
    pub priority: Priority,
    pub restart_policy: RestartPolicy,
    pub restarts: u32,
    pub recovery_attempts: u32,
    pub health: Option<HealthInfo>,
    pub allocation: Option<ResourceAllocation>,
    pub created_at: Timestamp,
}

/// Result of `shutdown_all`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    /// Workers still running at the deadline and killed
    pub forced: usize,
}

/// Aggregate fleet statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStats {
    pub workers: usize,
    pub by_state: BTreeMap<String, usize>,
    pub lifecycle: LifecycleStats,
    pub allocator: AllocatorStats,
    pub ipc: IpcStats,
    pub alerts: usize,
    pub metrics: MetricsSnapshot,
}
