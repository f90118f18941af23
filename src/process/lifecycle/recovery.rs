/*!
 * Failure Handling and Automated Recovery
 *
 * `mark_failed` moves a process to FAILED, fires the on-failure hooks and
 * schedules a recovery cycle when attempts remain:
 *
 *   backoff -> RECOVERING -> STARTING -> recovery action -> RUNNING
 *
 * The attempt counter grows when a cycle is scheduled and resets after a
 * successful one. Once the ceiling is reached the process stays FAILED
 * until a manual `start`.
 */

use super::hooks::{HookContext, HookEvent};
use super::manager::{LifecycleManager, RecoveryAction};
use crate::core::errors::{LifecycleError, LifecycleResult};
use crate::process::types::{ProcessState, TransitionTrigger};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl LifecycleManager {
    /// Install the action that relaunches a recovering process
    pub fn set_recovery_action(&self, action: RecoveryAction) {
        *self.inner.recovery_action.write() = Some(action);
    }

    pub fn clear_recovery_action(&self) {
        *self.inner.recovery_action.write() = None;
    }

    /// Opt one process in or out of automatic recovery
    pub fn set_recovery_enabled(&self, process_id: &str, enabled: bool) -> LifecycleResult<()> {
        let mut entry = self
            .inner
            .processes
            .get_mut(process_id)
            .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
        entry.recovery_enabled = enabled;
        Ok(())
    }

    pub fn recovery_attempts(&self, process_id: &str) -> Option<u32> {
        self.inner
            .processes
            .get(process_id)
            .map(|e| e.recovery_attempts)
    }

    pub fn is_recovering(&self, process_id: &str) -> bool {
        self.inner
            .processes
            .get(process_id)
            .is_some_and(|e| e.recovering)
    }

    /// Report a failure; returns whether a recovery cycle was scheduled
    pub async fn mark_failed(&self, process_id: &str, error: impl Into<String>) -> LifecycleResult<bool> {
        self.fail_with(process_id, error.into(), TransitionTrigger::Error)
            .await
    }

    pub(super) async fn fail_with(
        &self,
        process_id: &str,
        error: String,
        trigger: TransitionTrigger,
    ) -> LifecycleResult<bool> {
        let lock = self.process_lock(process_id)?;
        {
            let _serial = lock.lock().await;
            self.fail_locked(process_id, &error, trigger).await?;
        }

        error!(process_id = %process_id, trigger = ?trigger, error = %error, "Process failed");
        Ok(self.schedule_recovery(process_id))
    }

    /// Move to FAILED and record the error; the caller holds the process lock
    pub(super) async fn fail_locked(
        &self,
        process_id: &str,
        error: &str,
        trigger: TransitionTrigger,
    ) -> LifecycleResult<()> {
        let state = self
            .state(process_id)
            .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;

        if state != ProcessState::Failed {
            self.transition_locked(
                process_id,
                ProcessState::Failed,
                trigger,
                json!({ "error": error }),
                Some(error.to_string()),
            )
            .await?;
        }

        if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
            entry.health.is_healthy = false;
            entry.health.last_error = Some(error.to_string());
        }
        Ok(())
    }

    /// Schedule one recovery cycle if policy and attempt budget allow
    pub(super) fn schedule_recovery(&self, process_id: &str) -> bool {
        let recovery = &self.inner.config.recovery;
        if !recovery.enabled || self.is_closed() {
            return false;
        }

        let (attempt, delay) = {
            let Some(mut entry) = self.inner.processes.get_mut(process_id) else {
                return false;
            };
            if !entry.recovery_enabled || entry.recovering || entry.state != ProcessState::Failed {
                return false;
            }
            if entry.recovery_attempts >= recovery.max_attempts {
                warn!(
                    process_id = %process_id,
                    attempts = entry.recovery_attempts,
                    "Recovery attempts exhausted; manual start required"
                );
                return false;
            }
            entry.recovery_attempts += 1;
            entry.recovering = true;
            (
                entry.recovery_attempts,
                recovery.delay_for(entry.recovery_attempts - 1),
            )
        };

        info!(
            process_id = %process_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Recovery scheduled"
        );

        let weak = Arc::downgrade(&self.inner);
        let id = process_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                LifecycleManager { inner }.run_recovery(&id, attempt).await;
            }
        });
        self.inner
            .recovery_tasks
            .insert(process_id.to_string(), handle);
        true
    }

    async fn run_recovery(&self, process_id: &str, attempt: u32) {
        self.inner
            .counters
            .recoveries_attempted
            .fetch_add(1, Ordering::Relaxed);
        info!(process_id = %process_id, attempt, "Recovery attempt starting");

        let meta = json!({ "recovery_attempt": attempt });
        if let Err(e) = self
            .transition(process_id, ProcessState::Recovering, TransitionTrigger::Automatic, meta.clone())
            .await
        {
            // State moved on (manual start, stop, unregister) while waiting out the backoff
            debug!(process_id = %process_id, error = %e, "Recovery abandoned");
            self.abandon_recovery(process_id);
            return;
        }

        if let Err(e) = self
            .transition(process_id, ProcessState::Starting, TransitionTrigger::Automatic, meta.clone())
            .await
        {
            warn!(process_id = %process_id, error = %e, "Recovery could not enter STARTING");
            self.abandon_recovery(process_id);
            return;
        }

        let action = self.inner.recovery_action.read().clone();
        if let Some(action) = action {
            if let Err(e) = action(process_id.to_string()).await {
                self.set_recovering(process_id, false);
                let reason = format!("Recovery attempt {} failed: {}", attempt, e);
                if let Err(e) = self
                    .fail_with(process_id, reason, TransitionTrigger::Error)
                    .await
                {
                    debug!(process_id = %process_id, error = %e, "Could not mark failed recovery");
                }
                return;
            }
        }

        match self
            .transition(process_id, ProcessState::Running, TransitionTrigger::Automatic, meta)
            .await
        {
            Ok(()) => self.finish_recovery(process_id, attempt).await,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Recovery could not reach RUNNING");
                self.abandon_recovery(process_id);
            }
        }
    }

    async fn finish_recovery(&self, process_id: &str, attempt: u32) {
        if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
            entry.recovery_attempts = 0;
            entry.recovering = false;
            entry.health.reset();
        }
        self.inner
            .counters
            .recoveries_succeeded
            .fetch_add(1, Ordering::Relaxed);

        if let Ok(lock) = self.process_lock(process_id) {
            let _serial = lock.lock().await;
            let mut ctx = HookContext {
                process_id: process_id.to_string(),
                event: HookEvent::OnRecovery,
                from: ProcessState::Starting,
                to: ProcessState::Running,
                trigger: TransitionTrigger::Automatic,
                metadata: json!({ "recovery_attempt": attempt }),
                error: None,
            };
            self.fire(&mut ctx, HookEvent::OnRecovery).await;
        }

        info!(process_id = %process_id, attempt, "Process recovered");
    }

    fn set_recovering(&self, process_id: &str, recovering: bool) {
        if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
            entry.recovering = recovering;
        }
    }

    /// Drop the in-flight flag; retry if the process ended up FAILED meanwhile
    fn abandon_recovery(&self, process_id: &str) {
        self.set_recovering(process_id, false);
        if self.state(process_id) == Some(ProcessState::Failed) {
            self.schedule_recovery(process_id);
        }
    }
}
