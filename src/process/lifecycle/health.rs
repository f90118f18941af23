/*!
 * Health Checks
 * Score-tracked liveness checks feeding back into failure handling
 */

use super::hooks::{HookContext, HookEvent};
use super::manager::LifecycleManager;
use crate::core::errors::{LifecycleError, LifecycleResult};
use crate::core::limits::HEALTH_SCORE_FLOOR;
use crate::process::types::{ProcessState, TransitionTrigger};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, warn};

impl LifecycleManager {
    /// Check with the default predicate: state not in {FAILED, TERMINATED, UNKNOWN}
    pub async fn perform_health_check(&self, process_id: &str) -> LifecycleResult<bool> {
        let state = self
            .state(process_id)
            .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
        self.perform_health_check_with(process_id, async move { Ok(!state.is_unhealthy()) })
            .await
    }

    /// Run `check` and fold its outcome into the process's health record
    ///
    /// `Ok(false)` and `Err` both count as failures. When the score drops
    /// below the floor while RUNNING the process is marked failed.
    pub async fn perform_health_check_with<F>(&self, process_id: &str, check: F) -> LifecycleResult<bool>
    where
        F: Future<Output = anyhow::Result<bool>>,
    {
        if !self.is_registered(process_id) {
            return Err(LifecycleError::NotRegistered(process_id.to_string()));
        }

        let started = Instant::now();
        let (healthy, error) = match check.await {
            Ok(true) => (true, None),
            Ok(false) => (false, Some("health check failed".to_string())),
            Err(e) => (false, Some(e.to_string())),
        };
        let elapsed = started.elapsed();

        let (state, score) = {
            let mut entry = self
                .inner
                .processes
                .get_mut(process_id)
                .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
            entry.health.record(healthy, elapsed, error.clone());
            (entry.state, entry.health.health_score)
        };
        self.inner
            .counters
            .health_checks
            .fetch_add(1, Ordering::Relaxed);

        debug!(process_id = %process_id, healthy, score, response_ms = elapsed.as_millis() as u64, "Health check");

        let mut ctx = HookContext {
            process_id: process_id.to_string(),
            event: HookEvent::OnHealthCheck,
            from: state,
            to: state,
            trigger: TransitionTrigger::HealthCheck,
            metadata: json!({ "healthy": healthy, "health_score": score }),
            error: error.clone(),
        };
        self.fire(&mut ctx, HookEvent::OnHealthCheck).await;

        if score < HEALTH_SCORE_FLOOR && state == ProcessState::Running {
            warn!(process_id = %process_id, score, "Health score below floor");
            let reason = format!(
                "Health score {:.2} below floor: {}",
                score,
                error.as_deref().unwrap_or("unhealthy")
            );
            self.fail_with(process_id, reason, TransitionTrigger::HealthCheck)
                .await?;
        }

        Ok(healthy)
    }
}
