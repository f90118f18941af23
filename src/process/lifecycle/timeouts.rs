/*!
 * State Timeout Enforcement
 *
 * Startup-like states (STARTING, RESUMING, RESTARTING, RECOVERING) that
 * overstay their limit are failed. STOPPING and PAUSING are forced to
 * their resting state instead.
 */

use super::manager::LifecycleManager;
use crate::core::types::ProcessId;
use crate::process::types::{ProcessState, TransitionTrigger};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, warn};

impl LifecycleManager {
    /// Processes that have exceeded the dwell limit of their current state
    pub fn overdue(&self) -> Vec<(ProcessId, ProcessState)> {
        self.inner
            .processes
            .iter()
            .filter(|entry| self.is_overdue(entry.state, entry.entered))
            .map(|entry| (entry.key().clone(), entry.state))
            .collect()
    }

    fn is_overdue(&self, state: ProcessState, entered: Instant) -> bool {
        self.inner
            .config
            .timeouts
            .for_state(state)
            .is_some_and(|limit| Instant::now().saturating_duration_since(entered) > limit)
    }

    /// Still overdue in `state`; checked under the process lock
    fn still_overdue(&self, process_id: &str, state: ProcessState) -> bool {
        self.inner
            .processes
            .get(process_id)
            .is_some_and(|entry| entry.state == state && self.is_overdue(entry.state, entry.entered))
    }

    /// Enforce dwell limits once; returns the processes acted on
    pub async fn check_timeouts(&self) -> Vec<(ProcessId, ProcessState)> {
        let overdue = self.overdue();
        self.enforce_timeouts(overdue).await
    }

    /// Act on a scan result; entries whose state moved on since the scan are skipped
    pub(super) async fn enforce_timeouts(
        &self,
        overdue: Vec<(ProcessId, ProcessState)>,
    ) -> Vec<(ProcessId, ProcessState)> {
        let mut acted = Vec::with_capacity(overdue.len());

        for (process_id, state) in overdue {
            let Ok(lock) = self.process_lock(&process_id) else {
                continue;
            };
            let failed = {
                let _serial = lock.lock().await;
                if !self.still_overdue(&process_id, state) {
                    debug!(process_id = %process_id, state = %state, "State left before timeout enforcement");
                    continue;
                }

                warn!(process_id = %process_id, state = %state, "State timeout exceeded");
                let forced = json!({ "forced": true });
                let result = match state {
                    ProcessState::Stopping => self
                        .transition_locked(&process_id, ProcessState::Stopped, TransitionTrigger::Timeout, forced, None)
                        .await
                        .map(|_| None),
                    ProcessState::Pausing => self
                        .transition_locked(&process_id, ProcessState::Paused, TransitionTrigger::Timeout, forced, None)
                        .await
                        .map(|_| None),
                    _ => {
                        let reason = format!("Timed out in {}", state);
                        self.fail_locked(&process_id, &reason, TransitionTrigger::Timeout)
                            .await
                            .map(|_| Some(reason))
                    }
                };
                match result {
                    Ok(failed) => failed,
                    Err(e) => {
                        debug!(process_id = %process_id, error = %e, "Timeout enforcement skipped");
                        continue;
                    }
                }
            };

            if let Some(reason) = failed {
                error!(process_id = %process_id, trigger = ?TransitionTrigger::Timeout, error = %reason, "Process failed");
                self.schedule_recovery(&process_id);
            }
            acted.push((process_id, state));
        }

        acted
    }
}
