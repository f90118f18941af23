/*!
 * Stop Escalation
 * Graceful request, terminate signal, kill signal; and fleet shutdown
 */

use super::supervisor::Orchestrator;
use super::types::{ShutdownReport, StopOutcome};
use crate::core::limits::KILL_CONFIRM_TIMEOUT;
use crate::core::task;
use crate::core::types::OrchestratorResult;
use crate::ipc::IpcMessage;
use crate::monitoring::span_operation;
use crate::process::{ProcessSignal, ProcessState, TransitionTrigger};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl Orchestrator {
    /// Stop with the configured timeout
    pub async fn stop(&self, worker_id: &str, graceful: bool) -> OrchestratorResult<bool> {
        self.stop_with_timeout(worker_id, graceful, self.inner.config.stop_timeout)
            .await
    }

    /// RUNNING/PAUSED/FAILED -> STOPPING -> STOPPED
    ///
    /// Returns whether the OS process is confirmed gone. A stop whose kill
    /// could not be confirmed still ends in STOPPED.
    pub async fn stop_with_timeout(
        &self,
        worker_id: &str,
        graceful: bool,
        timeout: Duration,
    ) -> OrchestratorResult<bool> {
        let span = span_operation("stop", worker_id);
        self.require(worker_id)?;

        match self.inner.lifecycle.state(worker_id) {
            Some(ProcessState::Stopped | ProcessState::Terminated) => return Ok(true),
            Some(ProcessState::Initializing) => {
                self.inner
                    .lifecycle
                    .transition(worker_id, ProcessState::Stopped, TransitionTrigger::Manual, json!({}))
                    .await?;
                return Ok(true);
            }
            // A stopped process cannot read its mailbox or handle SIGTERM
            Some(ProcessState::Paused) => {
                self.inner.executor.signal(worker_id, ProcessSignal::Continue);
            }
            _ => {}
        }

        self.set_stopping(worker_id, true);
        if let Err(e) = self.inner.lifecycle.stop(worker_id).await {
            self.set_stopping(worker_id, false);
            return Err(e.into());
        }
        self.inner.monitor.unregister(worker_id);

        let outcome = self.escalate_stop(worker_id, graceful, timeout).await;
        self.inner.executor.remove(worker_id);

        if self.inner.lifecycle.state(worker_id) == Some(ProcessState::Stopping) {
            self.inner
                .lifecycle
                .complete(worker_id, TransitionTrigger::Manual)
                .await?;
        }
        self.set_stopping(worker_id, false);

        info!(worker_id = %worker_id, outcome = ?outcome, "Worker stopped");
        span.record_result(outcome.exited());
        Ok(outcome.exited())
    }

    /// Take the OS process down, escalating until it is gone
    ///
    /// SHUTDOWN request and `timeout` when graceful, then SIGTERM with half
    /// of `timeout`, then SIGKILL.
    pub(super) async fn escalate_stop(&self, worker_id: &str, graceful: bool, timeout: Duration) -> StopOutcome {
        let executor = &self.inner.executor;
        if !executor.is_alive(worker_id) {
            return StopOutcome::NotRunning;
        }

        if graceful {
            let deadline = Instant::now() + timeout;
            let request = IpcMessage::shutdown(true).with_timeout(timeout);
            match self.inner.ipc.send(worker_id, request).await {
                Ok(outcome) => debug!(worker_id = %worker_id, outcome = ?outcome, "Shutdown request answered"),
                Err(e) => debug!(worker_id = %worker_id, error = %e, "Shutdown request failed"),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if executor.wait_for_exit(worker_id, remaining).await {
                return StopOutcome::Graceful;
            }
            warn!(worker_id = %worker_id, "Worker ignored shutdown request; sending terminate");
        }

        if executor.terminate(worker_id) && executor.wait_for_exit(worker_id, timeout / 2).await {
            return StopOutcome::Terminated;
        }

        warn!(worker_id = %worker_id, "Worker survived terminate; killing");
        self.inner.metrics.inc_counter("workers.killed", 1.0);
        if executor.kill(worker_id) && executor.wait_for_exit(worker_id, KILL_CONFIRM_TIMEOUT).await {
            return StopOutcome::Killed;
        }

        error!(worker_id = %worker_id, "Worker exit not confirmed after kill");
        StopOutcome::Unconfirmed
    }

    /// Stop every worker within `timeout`, then tear the subsystems down
    ///
    /// Workers get two thirds of the deadline for a graceful stop; whatever
    /// is still running at the deadline is killed.
    pub async fn shutdown_all(&self, timeout: Duration) -> ShutdownReport {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        info!(workers = self.inner.workers.len(), timeout_ms = timeout.as_millis() as u64, "Fleet shutdown starting");

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        task::shutdown_all(tasks).await;

        let deadline = Instant::now() + timeout;
        let per_worker = timeout * 2 / 3;
        let mut ids: Vec<String> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        ids.sort();

        let stops = ids.iter().map(|id| async move {
            let result =
                tokio::time::timeout_at(deadline, self.stop_with_timeout(id, true, per_worker)).await;
            let stopped = matches!(result, Ok(Ok(true)));
            if !stopped {
                match result {
                    Ok(Err(e)) => warn!(worker_id = %id, error = %e, "Stop failed during shutdown"),
                    Err(_) => warn!(worker_id = %id, "Stop missed the shutdown deadline"),
                    Ok(Ok(_)) => {}
                }
                self.inner.executor.kill(id);
                self.inner.executor.remove(id);
            }
            stopped
        });
        let results = join_all(stops).await;

        let report = ShutdownReport {
            stopped: results.iter().filter(|s| **s).count(),
            forced: results.iter().filter(|s| !**s).count(),
        };

        self.inner.allocator.shutdown().await;
        self.inner.lifecycle.shutdown().await;
        self.inner.monitor.shutdown().await;
        self.inner.ipc.shutdown().await;

        info!(stopped = report.stopped, forced = report.forced, "Fleet shutdown complete");
        report
    }
}
