/*!
 * System Limits and Constants
 *
 * Centralized location for intervals, thresholds and buffer sizes.
 * Organized by component. Everything here is a default; most values can be
 * overridden through `OrchestratorConfig`.
 */

use std::time::Duration;

// =============================================================================
// IPC
// =============================================================================

/// Channel id reserved for the supervisor itself
pub const SUPERVISOR_CHANNEL: &str = "supervisor";

/// How often the local inbox is scanned
pub const DELIVERY_INTERVAL: Duration = Duration::from_millis(50);

/// Heartbeat broadcast period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A peer channel silent for longer than this is removed
pub const CHANNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Idle-channel sweep period
pub const CHANNEL_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout applied to a message that does not specify one
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox sub-directories
pub const INBOX_DIR: &str = "inbox";
pub const OUTBOX_DIR: &str = "outbox";
pub const ERRORS_DIR: &str = "errors";

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Recovery backoff schedule; the last value repeats
pub const RECOVERY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

/// Consecutive recovery attempts before giving up
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Health score penalty for a failed check
pub const HEALTH_FAILURE_STEP: f64 = 0.3;

/// Health score reward for a passed check (smaller than the penalty)
pub const HEALTH_SUCCESS_STEP: f64 = 0.1;

/// Below this score a RUNNING process is marked failed
pub const HEALTH_SCORE_FLOOR: f64 = 0.2;

/// Per-process transition log size
pub const TRANSITION_HISTORY_LIMIT: usize = 100;

/// State-timeout sweep period
pub const STATE_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub const STARTING_TIMEOUT: Duration = Duration::from_secs(60);
pub const STOPPING_TIMEOUT: Duration = Duration::from_secs(30);
pub const PAUSING_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESUMING_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESTARTING_TIMEOUT: Duration = Duration::from_secs(90);
pub const RECOVERING_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// RESOURCES
// =============================================================================

/// Fraction of the request granted when the full request does not fit
pub const REDUCED_GRANT_FRACTION: f64 = 0.7;

/// Per-allocation usage samples kept for utilization statistics
pub const USAGE_HISTORY_LIMIT: usize = 100;

/// Reallocation log size
pub const REALLOCATION_HISTORY_LIMIT: usize = 1000;

/// ADAPTIVE: shrink a dimension whose average utilization is below this
pub const ADAPTIVE_LOW_UTILIZATION: f64 = 0.30;

/// ADAPTIVE: grow a dimension whose average utilization is above this
pub const ADAPTIVE_HIGH_UTILIZATION: f64 = 0.80;

/// ADAPTIVE: relative step for shrink/grow
pub const ADAPTIVE_STEP: f64 = 0.20;

/// ADAPTIVE: shrinking never goes below this fraction of the original request
pub const ADAPTIVE_MIN_FRACTION: f64 = 0.10;

/// Utilization the performance score rewards
pub const ADAPTIVE_TARGET_UTILIZATION: f64 = 0.60;

/// Optimization pass period
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Fleet monitoring loop period
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-worker startup proof-of-life timeout
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between startup pings
pub const STARTUP_PING_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout of a single health-check ping
pub const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default graceful stop timeout
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the kernel to reap a killed worker
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default overall fleet shutdown deadline
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum supervised workers
pub const MAX_WORKERS: usize = 64;

/// Pause applied after a background tick fails
pub const LOOP_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Shortest period a background loop will run at
pub const MIN_LOOP_PERIOD: Duration = Duration::from_millis(1);

/// Alert ring size in the process monitor
pub const ALERT_HISTORY_LIMIT: usize = 500;

// =============================================================================
// WORKER
// =============================================================================

/// Time left for the shutdown acknowledgement to reach the supervisor
pub const SHUTDOWN_ACK_GRACE: Duration = Duration::from_millis(200);
