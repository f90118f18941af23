/*!
 * Lifecycle Manager
 * Per-process state machine with validated transitions and hooks
 *
 * The manager is the only writer of process state. Transitions for one
 * process are serialized through a per-process async lock and run to
 * completion (hooks included) before the next one starts. Transitions of
 * different processes proceed independently.
 *
 * Recovery, health checks and the timeout monitor live in sibling modules
 * as further `impl LifecycleManager` blocks.
 */

use super::hooks::{HookContext, HookEvent, HookHandler, HookRegistry, LifecycleHook};
use crate::core::config::{RecoveryConfig, StateTimeouts};
use crate::core::errors::{LifecycleError, LifecycleResult};
use crate::core::limits::{STATE_TIMEOUT_CHECK_INTERVAL, TRANSITION_HISTORY_LIMIT};
use crate::core::task::{self, LoopTask};
use crate::core::types::{now_micros, ProcessId, Timestamp};
use crate::process::types::{
    HealthInfo, LifecycleStats, ProcessSnapshot, ProcessState, StateTransition, TransitionTrigger,
};
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Relaunches the OS process of a recovering worker
///
/// Runs between RECOVERING -> STARTING and STARTING -> RUNNING.
pub type RecoveryAction = Arc<dyn Fn(ProcessId) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a `RecoveryAction`
pub fn recovery_action<F, Fut>(f: F) -> RecoveryAction
where
    F: Fn(ProcessId) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |process_id| Box::pin(f(process_id)))
}

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub recovery: RecoveryConfig,
    pub timeouts: StateTimeouts,
    pub timeout_check_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            recovery: RecoveryConfig::default(),
            timeouts: StateTimeouts::default(),
            timeout_check_interval: STATE_TIMEOUT_CHECK_INTERVAL,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StateTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

pub(super) struct ProcessEntry {
    pub(super) state: ProcessState,
    pub(super) entered: Instant,
    pub(super) entered_at: Timestamp,
    pub(super) history: VecDeque<StateTransition>,
    pub(super) health: HealthInfo,
    pub(super) recovery_attempts: u32,
    pub(super) recovering: bool,
    pub(super) recovery_enabled: bool,
    pub(super) restart_pending: bool,
}

impl ProcessEntry {
    fn new(process_id: &str) -> Self {
        Self {
            state: ProcessState::Initializing,
            entered: Instant::now(),
            entered_at: now_micros(),
            history: VecDeque::with_capacity(16),
            health: HealthInfo::new(process_id),
            recovery_attempts: 0,
            recovering: false,
            recovery_enabled: true,
            restart_pending: false,
        }
    }

    fn push_history(&mut self, record: StateTransition) {
        if self.history.len() >= TRANSITION_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

#[derive(Default)]
pub(super) struct Counters {
    pub(super) transitions_ok: AtomicU64,
    pub(super) transitions_failed: AtomicU64,
    pub(super) invalid_transitions: AtomicU64,
    pub(super) recoveries_attempted: AtomicU64,
    pub(super) recoveries_succeeded: AtomicU64,
    pub(super) health_checks: AtomicU64,
    pub(super) hook_failures: AtomicU64,
}

pub(super) struct LifecycleInner {
    pub(super) config: LifecycleConfig,
    pub(super) processes: DashMap<ProcessId, ProcessEntry, RandomState>,
    pub(super) locks: DashMap<ProcessId, Arc<tokio::sync::Mutex<()>>, RandomState>,
    pub(super) hooks: HookRegistry,
    pub(super) recovery_action: RwLock<Option<RecoveryAction>>,
    pub(super) recovery_tasks: DashMap<ProcessId, JoinHandle<()>, RandomState>,
    pub(super) counters: Counters,
    pub(super) tasks: Mutex<Vec<LoopTask>>,
    pub(super) closed: AtomicBool,
}

/// Lifecycle manager handle; cheap to clone
#[derive(Clone)]
pub struct LifecycleManager {
    pub(super) inner: Arc<LifecycleInner>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        info!(
            max_recovery_attempts = config.recovery.max_attempts,
            recovery_enabled = config.recovery.enabled,
            "Lifecycle manager initialized"
        );
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                processes: DashMap::with_hasher(RandomState::new()),
                locks: DashMap::with_hasher(RandomState::new()),
                hooks: HookRegistry::new(),
                recovery_action: RwLock::new(None),
                recovery_tasks: DashMap::with_hasher(RandomState::new()),
                counters: Counters::default(),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Register a process in INITIALIZING
    pub fn register_process(&self, process_id: &str) -> LifecycleResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.inner.processes.entry(process_id.to_string()) {
            Entry::Occupied(_) => Err(LifecycleError::AlreadyRegistered(process_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ProcessEntry::new(process_id));
                self.inner
                    .locks
                    .insert(process_id.to_string(), Arc::new(tokio::sync::Mutex::new(())));
                info!(process_id = %process_id, "Process registered");
                Ok(())
            }
        }
    }

    /// Forget a process: state, history, health, scoped hooks and pending recovery
    pub fn unregister_process(&self, process_id: &str) -> LifecycleResult<()> {
        if self.inner.processes.remove(process_id).is_none() {
            return Err(LifecycleError::NotRegistered(process_id.to_string()));
        }
        self.inner.locks.remove(process_id);
        if let Some((_, handle)) = self.inner.recovery_tasks.remove(process_id) {
            handle.abort();
        }
        let hooks = self.inner.hooks.remove_process_hooks(process_id);
        info!(process_id = %process_id, hooks_removed = hooks, "Process unregistered");
        Ok(())
    }

    pub fn is_registered(&self, process_id: &str) -> bool {
        self.inner.processes.contains_key(process_id)
    }

    pub fn state(&self, process_id: &str) -> Option<ProcessState> {
        self.inner.processes.get(process_id).map(|e| e.state)
    }

    /// Time spent in the current state
    pub fn time_in_state(&self, process_id: &str) -> Option<Duration> {
        self.inner
            .processes
            .get(process_id)
            .map(|e| Instant::now().saturating_duration_since(e.entered))
    }

    pub fn history(&self, process_id: &str) -> Vec<StateTransition> {
        self.inner
            .processes
            .get(process_id)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn health(&self, process_id: &str) -> Option<HealthInfo> {
        self.inner.processes.get(process_id).map(|e| e.health.clone())
    }

    pub fn snapshot(&self, process_id: &str) -> Option<ProcessSnapshot> {
        self.inner.processes.get(process_id).map(|e| ProcessSnapshot {
            process_id: process_id.to_string(),
            state: e.state,
            state_entered_at: e.entered_at,
            recovery_attempts: e.recovery_attempts,
            recovering: e.recovering,
            health: e.health.clone(),
        })
    }

    pub fn processes(&self) -> Vec<ProcessId> {
        self.inner.processes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn processes_in(&self, state: ProcessState) -> Vec<ProcessId> {
        self.inner
            .processes
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn register_hook(&self, hook: LifecycleHook) -> Uuid {
        self.inner.hooks.register(hook)
    }

    /// Register `handler` for `event` on every process
    pub fn on(&self, event: HookEvent, name: &str, handler: HookHandler) -> Uuid {
        self.register_hook(LifecycleHook::new(name, event, handler))
    }

    pub fn remove_hook(&self, id: Uuid) -> bool {
        self.inner.hooks.remove(id)
    }

    pub fn set_hook_enabled(&self, id: Uuid, enabled: bool) -> bool {
        self.inner.hooks.set_enabled(id, enabled)
    }

    pub fn remove_process_hooks(&self, process_id: &str) -> usize {
        self.inner.hooks.remove_process_hooks(process_id)
    }

    /// Move `process_id` to `target`
    ///
    /// Targets outside the allowed set for the current state are rejected
    /// without touching the state. On success: before-hooks, state change,
    /// after-hooks, on-state-change hooks, then the history record.
    pub async fn transition(
        &self,
        process_id: &str,
        target: ProcessState,
        trigger: TransitionTrigger,
        metadata: Value,
    ) -> LifecycleResult<()> {
        let result = match self.process_lock(process_id) {
            Ok(lock) => {
                let _serial = lock.lock().await;
                self.transition_locked(process_id, target, trigger, metadata, None)
                    .await
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.inner
                .counters
                .transitions_failed
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub(super) async fn transition_locked(
        &self,
        process_id: &str,
        target: ProcessState,
        trigger: TransitionTrigger,
        metadata: Value,
        error: Option<String>,
    ) -> LifecycleResult<()> {
        let (from, dwell) = {
            let entry = self
                .inner
                .processes
                .get(process_id)
                .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
            (entry.state, Instant::now().saturating_duration_since(entry.entered))
        };

        if !from.can_transition_to(target) {
            self.inner
                .counters
                .invalid_transitions
                .fetch_add(1, Ordering::Relaxed);
            warn!(process_id = %process_id, from = %from, to = %target, trigger = ?trigger, "Invalid transition rejected");

            let err = LifecycleError::InvalidTransition {
                process_id: process_id.to_string(),
                from,
                to: target,
            };
            if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
                entry.push_history(StateTransition {
                    from,
                    to: target,
                    trigger,
                    timestamp: now_micros(),
                    duration: dwell,
                    success: false,
                    error: Some(err.to_string()),
                    metadata,
                });
            }
            return Err(err);
        }

        let mut ctx = HookContext {
            process_id: process_id.to_string(),
            event: HookEvent::OnStateChange,
            from,
            to: target,
            trigger,
            metadata: metadata.clone(),
            error: error.clone(),
        };

        if let Some(event) = HookEvent::before(target) {
            self.fire(&mut ctx, event).await;
        }

        let after_restart = {
            let mut entry = self
                .inner
                .processes
                .get_mut(process_id)
                .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
            entry.state = target;
            entry.entered = Instant::now();
            entry.entered_at = now_micros();

            if target == ProcessState::Restarting {
                entry.restart_pending = true;
            }
            let after_restart = entry.restart_pending
                && from == ProcessState::Starting
                && target == ProcessState::Running;
            if after_restart || matches!(target, ProcessState::Failed | ProcessState::Stopped) {
                entry.restart_pending = false;
            }
            after_restart
        };

        info!(process_id = %process_id, from = %from, to = %target, trigger = ?trigger, "State transition");

        if let Some(event) = HookEvent::after(from, target) {
            self.fire(&mut ctx, event).await;
        }
        if after_restart {
            self.fire(&mut ctx, HookEvent::AfterRestart).await;
        }
        self.fire(&mut ctx, HookEvent::OnStateChange).await;

        if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
            entry.push_history(StateTransition {
                from,
                to: target,
                trigger,
                timestamp: now_micros(),
                duration: dwell,
                success: true,
                error,
                metadata,
            });
        }
        self.inner.counters.transitions_ok.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(super) async fn fire(&self, ctx: &mut HookContext, event: HookEvent) {
        ctx.event = event;
        let failures = self.inner.hooks.run(ctx).await;
        if failures > 0 {
            self.inner
                .counters
                .hook_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
    }

    pub(super) fn process_lock(&self, process_id: &str) -> LifecycleResult<Arc<tokio::sync::Mutex<()>>> {
        self.inner
            .locks
            .get(process_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))
    }

    /// Enter STARTING
    ///
    /// Starting from FAILED is a manual intervention and clears the
    /// recovery attempt counter.
    pub async fn start(&self, process_id: &str) -> LifecycleResult<()> {
        if self.state(process_id) == Some(ProcessState::Failed) {
            if let Some(mut entry) = self.inner.processes.get_mut(process_id) {
                entry.recovery_attempts = 0;
            }
        }
        self.transition(process_id, ProcessState::Starting, TransitionTrigger::Manual, Value::Null)
            .await
    }

    pub async fn stop(&self, process_id: &str) -> LifecycleResult<()> {
        self.transition(process_id, ProcessState::Stopping, TransitionTrigger::Manual, Value::Null)
            .await
    }

    pub async fn pause(&self, process_id: &str) -> LifecycleResult<()> {
        self.transition(process_id, ProcessState::Pausing, TransitionTrigger::Manual, Value::Null)
            .await
    }

    pub async fn resume(&self, process_id: &str) -> LifecycleResult<()> {
        self.transition(process_id, ProcessState::Resuming, TransitionTrigger::Manual, Value::Null)
            .await
    }

    pub async fn restart(&self, process_id: &str) -> LifecycleResult<()> {
        self.transition(process_id, ProcessState::Restarting, TransitionTrigger::Manual, Value::Null)
            .await
    }

    pub async fn terminate(&self, process_id: &str) -> LifecycleResult<()> {
        self.transition(process_id, ProcessState::Terminated, TransitionTrigger::Manual, Value::Null)
            .await
    }

    /// Finish the current transitional state
    ///
    /// STARTING/RESUMING -> RUNNING, STOPPING -> STOPPED, PAUSING -> PAUSED,
    /// RESTARTING/RECOVERING -> STARTING. Returns the state reached.
    pub async fn complete(&self, process_id: &str, trigger: TransitionTrigger) -> LifecycleResult<ProcessState> {
        let current = self
            .state(process_id)
            .ok_or_else(|| LifecycleError::NotRegistered(process_id.to_string()))?;
        let target = match current {
            ProcessState::Starting | ProcessState::Resuming => ProcessState::Running,
            ProcessState::Stopping => ProcessState::Stopped,
            ProcessState::Pausing => ProcessState::Paused,
            ProcessState::Restarting | ProcessState::Recovering => ProcessState::Starting,
            other => {
                return Err(LifecycleError::InvalidTransition {
                    process_id: process_id.to_string(),
                    from: other,
                    to: other,
                })
            }
        };
        self.transition(process_id, target, trigger, Value::Null).await?;
        Ok(target)
    }

    pub fn stats(&self) -> LifecycleStats {
        let c = &self.inner.counters;
        LifecycleStats {
            processes: self.inner.processes.len(),
            transitions_ok: c.transitions_ok.load(Ordering::Relaxed),
            transitions_failed: c.transitions_failed.load(Ordering::Relaxed),
            invalid_transitions: c.invalid_transitions.load(Ordering::Relaxed),
            recoveries_attempted: c.recoveries_attempted.load(Ordering::Relaxed),
            recoveries_succeeded: c.recoveries_succeeded.load(Ordering::Relaxed),
            health_checks: c.health_checks.load(Ordering::Relaxed),
            hook_failures: c.hook_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the state-timeout monitor
    pub fn start_monitoring(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tasks.push(LoopTask::spawn(
            "lifecycle-timeouts",
            self.inner.config.timeout_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        LifecycleManager { inner }.check_timeouts().await;
                    }
                    Ok(())
                }
            },
        ));
        debug!("Lifecycle timeout monitor started");
    }

    /// Stop the timeout monitor and cancel pending recoveries
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        task::shutdown_all(tasks).await;

        let pending: Vec<ProcessId> = self
            .inner
            .recovery_tasks
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in pending {
            if let Some((_, handle)) = self.inner.recovery_tasks.remove(&id) {
                handle.abort();
                let _ = handle.await;
            }
        }
        info!("Lifecycle manager shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
