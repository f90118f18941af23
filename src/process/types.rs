/*!
 * Process Types
 * Lifecycle states, transition records and health information
 */

use crate::core::limits::{HEALTH_FAILURE_STEP, HEALTH_SUCCESS_STEP};
use crate::core::types::{now_micros, ProcessId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Initializing,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Restarting,
    Failed,
    Recovering,
    Terminated,
    Unknown,
}

impl ProcessState {
    pub const ALL: [ProcessState; 13] = [
        ProcessState::Initializing,
        ProcessState::Starting,
        ProcessState::Running,
        ProcessState::Pausing,
        ProcessState::Paused,
        ProcessState::Resuming,
        ProcessState::Stopping,
        ProcessState::Stopped,
        ProcessState::Restarting,
        ProcessState::Failed,
        ProcessState::Recovering,
        ProcessState::Terminated,
        ProcessState::Unknown,
    ];

    /// States reachable from `self` in one transition
    pub fn allowed_targets(self) -> &'static [ProcessState] {
        use ProcessState::*;
        match self {
            Initializing => &[Starting, Stopped, Failed, Terminated],
            Starting => &[Running, Failed, Stopping, Terminated],
            Running => &[Pausing, Stopping, Restarting, Failed, Terminated],
            Pausing => &[Paused, Running, Failed],
            Paused => &[Resuming, Stopping, Failed, Terminated],
            Resuming => &[Running, Failed],
            Stopping => &[Stopped, Failed, Terminated],
            Stopped => &[Starting, Terminated],
            Restarting => &[Starting, Stopping, Failed],
            Failed => &[Recovering, Starting, Stopping, Stopped, Terminated],
            Recovering => &[Starting, Failed, Terminated],
            Unknown => &[Initializing, Stopped, Failed, Terminated],
            Terminated => &[],
        }
    }

    #[inline]
    pub fn can_transition_to(self, target: ProcessState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States with a bounded dwell time
    #[inline]
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Stopping
                | ProcessState::Pausing
                | ProcessState::Resuming
                | ProcessState::Restarting
                | ProcessState::Recovering
        )
    }

    /// States the default health predicate reports as unhealthy
    #[inline]
    pub fn is_unhealthy(self) -> bool {
        matches!(
            self,
            ProcessState::Failed | ProcessState::Terminated | ProcessState::Unknown
        )
    }

    /// States in which the worker process is expected to be alive
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Initializing => "INITIALIZING",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Pausing => "PAUSING",
            ProcessState::Paused => "PAUSED",
            ProcessState::Resuming => "RESUMING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Restarting => "RESTARTING",
            ProcessState::Failed => "FAILED",
            ProcessState::Recovering => "RECOVERING",
            ProcessState::Terminated => "TERMINATED",
            ProcessState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    Manual,
    Automatic,
    HealthCheck,
    Timeout,
    Error,
    Signal,
    External,
}

/// Immutable record of one transition attempt
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub from: ProcessState,
    pub to: ProcessState,
    pub trigger: TransitionTrigger,
    pub timestamp: Timestamp,
    /// Time spent in `from` before leaving it
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Health record of one worker
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthInfo {
    pub process_id: ProcessId,
    pub is_healthy: bool,
    pub last_check: Timestamp,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_time: Duration,
    pub error_count: u64,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub health_score: f64,
}

impl HealthInfo {
    pub fn new(process_id: impl Into<ProcessId>) -> Self {
        Self {
            process_id: process_id.into(),
            is_healthy: true,
            last_check: 0,
            response_time: Duration::ZERO,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
            health_score: 1.0,
        }
    }

    /// Fold one check outcome into the record
    ///
    /// Failures cost more than successes earn back; the score stays in [0, 1].
    pub fn record(&mut self, healthy: bool, response_time: Duration, error: Option<String>) {
        self.is_healthy = healthy;
        self.last_check = now_micros();
        self.response_time = response_time;

        if healthy {
            self.consecutive_failures = 0;
            self.health_score = (self.health_score + HEALTH_SUCCESS_STEP).min(1.0);
        } else {
            self.error_count += 1;
            self.consecutive_failures += 1;
            self.last_error = error;
            self.health_score = (self.health_score - HEALTH_FAILURE_STEP).max(0.0);
        }
    }

    pub fn reset(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.health_score = 1.0;
    }
}

/// Lifecycle manager counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleStats {
    pub processes: usize,
    pub transitions_ok: u64,
    pub transitions_failed: u64,
    pub invalid_transitions: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub health_checks: u64,
    pub hook_failures: u64,
}

/// Snapshot of one registered process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    pub process_id: ProcessId,
    pub state: ProcessState,
    pub state_entered_at: Timestamp,
    pub recovery_attempts: u32,
    pub recovering: bool,
    pub health: HealthInfo,
}
