/*!
 * Supervisor
 * Fleet façade over the lifecycle manager, resource allocator, IPC manager
 * and process monitor
 *
 * Each collaborator owns its own table; the supervisor only coordinates
 * them through lifecycle hooks and explicit calls. One `Orchestrator`
 * instance supervises one fleet and holds no global state.
 *
 * Startup order: IPC, lifecycle, allocator, monitor. `shutdown_all`
 * tears them down in reverse.
 */

use super::types::{ConfigSource, FleetStats, StaticConfigSource, WorkerInfo};
use crate::core::config::{OrchestratorConfig, RestartPolicy, WorkerConfig};
use crate::core::errors::OrchestratorError;
use crate::core::limits::{HEALTH_PING_TIMEOUT, STARTUP_PING_INTERVAL};
use crate::core::task::LoopTask;
use crate::core::types::{now_micros, OrchestratorResult, ProcessId, Timestamp};
use crate::ipc::{IpcManager, SendOutcome};
use crate::monitoring::{span_operation, MetricsCollector, ProcessMonitor, ReportedMetrics};
use crate::process::{
    ExecutionConfig, LifecycleConfig, LifecycleManager, ProcessExecutor, ProcessSignal, ProcessState,
    TransitionTrigger,
};
use crate::resources::{AllocatorConfig, ResourceAllocator, ResourceLimits};
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on a single startup ping round-trip
const PING_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Slack for floating-point fleet ceilings
const CEILING_EPSILON: f64 = 1e-9;

pub(super) struct WorkerRecord {
    pub(super) config: WorkerConfig,
    /// Output of the config source for the current run
    pub(super) materialized: Option<WorkerConfig>,
    pub(super) restarts: u32,
    pub(super) created_at: Timestamp,
    /// Set while the supervisor itself is taking the process down
    pub(super) stopping: bool,
    pub(super) last_health_check: Option<Instant>,
}

impl WorkerRecord {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            materialized: None,
            restarts: 0,
            created_at: now_micros(),
            stopping: false,
            last_health_check: None,
        }
    }

    fn effective(&self) -> &WorkerConfig {
        self.materialized.as_ref().unwrap_or(&self.config)
    }
}

pub(super) struct OrchestratorInner {
    pub(super) config: OrchestratorConfig,
    pub(super) ipc: IpcManager,
    pub(super) lifecycle: LifecycleManager,
    pub(super) allocator: ResourceAllocator,
    pub(super) monitor: ProcessMonitor,
    pub(super) executor: ProcessExecutor,
    pub(super) metrics: MetricsCollector,
    pub(super) workers: DashMap<ProcessId, WorkerRecord, RandomState>,
    pub(super) config_source: Arc<dyn ConfigSource>,
    // Serializes admission check and record insertion
    admission: Mutex<()>,
    pub(super) tasks: Mutex<Vec<LoopTask>>,
    pub(super) closed: AtomicBool,
}

/// Fleet supervisor handle; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    pub(super) inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub async fn new(config: OrchestratorConfig) -> OrchestratorResult<Self> {
        Self::with_config_source(config, Arc::new(StaticConfigSource)).await
    }

    /// Build the supervisor and start its IPC loops
    pub async fn with_config_source(
        config: OrchestratorConfig,
        config_source: Arc<dyn ConfigSource>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let metrics = MetricsCollector::new();
        let ipc = IpcManager::supervisor(config.ipc.clone()).await?;
        let lifecycle = LifecycleManager::new(
            LifecycleConfig::default()
                .with_recovery(config.recovery.clone())
                .with_timeouts(config.state_timeouts.clone()),
        );
        let allocator = ResourceAllocator::new(AllocatorConfig {
            capacity: config.system_capacity,
            default_limits: config.default_limits,
            strategy: config.allocation_strategy,
            optimize_interval: config.optimize_interval,
        });
        let monitor = ProcessMonitor::new(config.alert_thresholds.clone(), metrics.clone());

        let orchestrator = Self {
            inner: Arc::new(OrchestratorInner {
                config,
                ipc,
                lifecycle,
                allocator,
                monitor,
                executor: ProcessExecutor::new(),
                metrics,
                workers: DashMap::with_hasher(RandomState::new()),
                config_source,
                admission: Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        orchestrator.install_recovery_action();
        orchestrator.install_channel_keep_alive();
        orchestrator.inner.ipc.start();

        info!(
            max_workers = orchestrator.inner.config.max_workers,
            strategy = orchestrator.inner.config.allocation_strategy.as_str(),
            "Orchestrator initialized"
        );
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn ipc(&self) -> &IpcManager {
        &self.inner.ipc
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.inner.allocator
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.inner.monitor
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Spawn every background loop: state timeouts, resource optimization,
    /// process sampling and the fleet monitoring loop
    pub fn start_monitoring(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        self.inner.lifecycle.start_monitoring();
        self.inner.allocator.start();
        self.inner.monitor.start(self.inner.config.monitor_interval);

        let weak = Arc::downgrade(&self.inner);
        tasks.push(LoopTask::spawn(
            "supervisor-monitor",
            self.inner.config.monitor_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Orchestrator { inner }.monitor_tick().await;
                    }
                    Ok(())
                }
            },
        ));
        info!("Fleet monitoring started");
    }

    /// Admit and register a worker; nothing is spawned until `start`
    pub async fn create(&self, worker_id: &str, config: WorkerConfig) -> OrchestratorResult<()> {
        let span = span_operation("create", worker_id);
        self.ensure_open()?;

        let mut config = config;
        config.worker_id = worker_id.to_string();
        config.validate()?;

        {
            let _admission = self.inner.admission.lock();
            if self.inner.workers.contains_key(worker_id) {
                return Err(OrchestratorError::WorkerExists(worker_id.to_string()));
            }
            self.admit(&config)?;
            self.inner
                .workers
                .insert(worker_id.to_string(), WorkerRecord::new(config.clone()));
        }

        if let Err(e) = self.register_worker(worker_id, &config).await {
            self.inner.workers.remove(worker_id);
            if self.inner.lifecycle.is_registered(worker_id) {
                if let Err(cleanup) = self.inner.lifecycle.unregister_process(worker_id) {
                    debug!(worker_id = %worker_id, error = %cleanup, "Could not unregister after failed create");
                }
            }
            warn!(worker_id = %worker_id, error = %e, "Worker registration failed");
            return Err(e);
        }

        self.inner.metrics.inc_counter("workers.created", 1.0);
        info!(
            worker_id = %worker_id,
            priority = %config.priority,
            restart_policy = ?config.restart_policy,
            "Worker created"
        );
        span.record_result(true);
        Ok(())
    }

    async fn register_worker(&self, worker_id: &str, config: &WorkerConfig) -> OrchestratorResult<()> {
        self.inner.ipc.create_channel(worker_id).await?;
        self.inner.lifecycle.register_process(worker_id)?;
        self.inner
            .lifecycle
            .set_recovery_enabled(worker_id, config.restart_policy.recovers_failures())?;
        self.wire_hooks(worker_id);
        Ok(())
    }

    /// Fleet ceilings: worker count, then summed requested memory and CPU
    fn admit(&self, config: &WorkerConfig) -> OrchestratorResult<()> {
        let denied = |reason: String| OrchestratorError::AdmissionDenied {
            process_id: config.worker_id.clone(),
            reason,
        };

        let max_workers = self.inner.config.max_workers;
        if self.inner.workers.len() >= max_workers {
            return Err(denied(format!("worker ceiling of {} reached", max_workers)));
        }

        let requested = self.requested_limits(config);
        let (memory, cpu) = self.inner.workers.iter().fold((0.0, 0.0), |(m, c), entry| {
            let limits = self.requested_limits(&entry.config);
            (m + limits.memory_mb, c + limits.cpu_percent)
        });

        let max_memory = self.inner.config.max_total_memory_mb;
        if memory + requested.memory_mb > max_memory + CEILING_EPSILON {
            return Err(denied(format!(
                "fleet memory would reach {:.1} of {:.1} MB",
                memory + requested.memory_mb,
                max_memory
            )));
        }
        let max_cpu = self.inner.config.max_total_cpu_percent;
        if cpu + requested.cpu_percent > max_cpu + CEILING_EPSILON {
            return Err(denied(format!(
                "fleet CPU would reach {:.1} of {:.1}%",
                cpu + requested.cpu_percent,
                max_cpu
            )));
        }
        Ok(())
    }

    fn requested_limits(&self, config: &WorkerConfig) -> ResourceLimits {
        config
            .resource_limits
            .unwrap_or_else(|| self.inner.allocator.default_request(config.priority))
    }

    /// INITIALIZING/STOPPED/FAILED -> STARTING -> RUNNING
    ///
    /// RUNNING is only reached once the worker answered `ping`; otherwise
    /// the worker is marked failed.
    pub async fn start(&self, worker_id: &str) -> OrchestratorResult<()> {
        let span = span_operation("start", worker_id);
        self.ensure_open()?;
        self.require(worker_id)?;

        self.set_stopping(worker_id, false);
        self.inner.lifecycle.start(worker_id).await?;
        self.bring_up(worker_id).await?;

        span.record_result(true);
        Ok(())
    }

    /// From STARTING: verify the reservation, launch, then enter RUNNING
    async fn bring_up(&self, worker_id: &str) -> OrchestratorResult<()> {
        if let Err(e) = self.ensure_allocation(worker_id) {
            self.fail(worker_id, &e).await;
            return Err(e);
        }
        if let Err(e) = self.launch(worker_id).await {
            self.fail(worker_id, &e).await;
            return Err(e);
        }
        self.inner
            .lifecycle
            .complete(worker_id, TransitionTrigger::Automatic)
            .await?;
        Ok(())
    }

    /// The before-start hook reserves resources; a hook failure does not
    /// block the transition, so the reservation is checked here
    fn ensure_allocation(&self, worker_id: &str) -> OrchestratorResult<()> {
        if self.inner.allocator.has_allocation(worker_id) {
            return Ok(());
        }
        let config = self
            .effective_config(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
        self.inner
            .allocator
            .allocate(worker_id, config.priority, config.resource_limits)?;
        Ok(())
    }

    /// Spawn the worker process and wait for its first `ping` answer
    pub(super) async fn launch(&self, worker_id: &str) -> OrchestratorResult<u32> {
        let config = self
            .effective_config(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;

        // A leftover process from the previous run is killed and reaped
        if self.inner.executor.contains(worker_id) {
            self.inner.executor.remove(worker_id);
        }

        // Fresh mailbox so the new process never sees stale messages
        self.inner.ipc.remove_channel(worker_id).await?;
        self.inner.ipc.create_channel(worker_id).await?;

        let exec = self.execution_config(&config)?;
        let timer = self.inner.metrics.timer("worker.startup_seconds");
        let os_pid = self.inner.executor.spawn(worker_id, &exec)?;
        self.await_ping(worker_id, config.startup_timeout).await?;
        drop(timer);

        self.inner.metrics.inc_counter("workers.launched", 1.0);
        info!(worker_id = %worker_id, os_pid, "Worker answered startup ping");
        Ok(os_pid)
    }

    fn execution_config(&self, config: &WorkerConfig) -> OrchestratorResult<ExecutionConfig> {
        let blob = config.to_blob()?;
        let root = self.inner.config.ipc.root.to_string_lossy().into_owned();
        Ok(ExecutionConfig::new(self.inner.config.worker_program.clone())
            .with_args(self.inner.config.worker_args.iter().cloned())
            .with_args([config.worker_id.clone(), blob, root]))
    }

    async fn await_ping(&self, worker_id: &str, timeout: Duration) -> OrchestratorResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.inner.executor.is_alive(worker_id) {
                let status = self
                    .inner
                    .executor
                    .exit_status(worker_id)
                    .map_or_else(|| "unknown status".to_string(), |s| s.to_string());
                return Err(OrchestratorError::SpawnFailed {
                    process_id: worker_id.to_string(),
                    reason: format!("exited during startup: {}", status),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::StartupFailed {
                    process_id: worker_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            match self
                .inner
                .ipc
                .request_with_timeout(worker_id, "ping", json!({}), remaining.min(PING_ATTEMPT_TIMEOUT))
                .await
            {
                Ok(SendOutcome::Response(_)) => return Ok(()),
                Ok(outcome) => debug!(worker_id = %worker_id, outcome = ?outcome, "Startup ping unanswered"),
                Err(e) => debug!(worker_id = %worker_id, error = %e, "Startup ping failed"),
            }

            let pause = STARTUP_PING_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    /// RUNNING -> RESTARTING -> STARTING -> RUNNING with a fresh process
    ///
    /// A stopped or failed worker is simply started.
    pub async fn restart(&self, worker_id: &str) -> OrchestratorResult<()> {
        let span = span_operation("restart", worker_id);
        self.ensure_open()?;
        self.require(worker_id)?;

        if matches!(
            self.inner.lifecycle.state(worker_id),
            Some(ProcessState::Initializing | ProcessState::Stopped | ProcessState::Failed)
        ) {
            return self.start(worker_id).await;
        }

        self.inner.lifecycle.restart(worker_id).await?;
        self.set_stopping(worker_id, true);
        self.inner.monitor.unregister(worker_id);

        let outcome = self
            .escalate_stop(worker_id, true, self.inner.config.stop_timeout)
            .await;
        debug!(worker_id = %worker_id, outcome = ?outcome, "Previous process stopped for restart");
        self.inner.executor.remove(worker_id);

        self.set_stopping(worker_id, false);
        if let Some(mut record) = self.inner.workers.get_mut(worker_id) {
            record.restarts += 1;
        }
        self.inner.metrics.inc_counter("workers.restarted", 1.0);

        self.inner
            .lifecycle
            .complete(worker_id, TransitionTrigger::Manual)
            .await?;
        self.bring_up(worker_id).await?;

        span.record_result(true);
        Ok(())
    }

    /// RUNNING -> PAUSING -> PAUSED; the OS process is stopped with SIGSTOP
    pub async fn pause(&self, worker_id: &str) -> OrchestratorResult<()> {
        self.require(worker_id)?;
        self.inner.lifecycle.pause(worker_id).await?;
        self.signal_then_complete(worker_id, ProcessSignal::Stop).await
    }

    /// PAUSED -> RESUMING -> RUNNING; the OS process is continued with SIGCONT
    pub async fn resume(&self, worker_id: &str) -> OrchestratorResult<()> {
        self.require(worker_id)?;
        self.inner.lifecycle.resume(worker_id).await?;
        self.signal_then_complete(worker_id, ProcessSignal::Continue)
            .await
    }

    async fn signal_then_complete(&self, worker_id: &str, signal: ProcessSignal) -> OrchestratorResult<()> {
        if !self.inner.executor.signal(worker_id, signal) {
            let err = OrchestratorError::SignalFailed {
                process_id: worker_id.to_string(),
                signal: format!("{:?}", signal),
            };
            self.fail(worker_id, &err).await;
            return Err(err);
        }
        self.inner
            .lifecycle
            .complete(worker_id, TransitionTrigger::Signal)
            .await?;
        Ok(())
    }

    /// Stop if needed, then drop every trace of the worker
    pub async fn destroy(&self, worker_id: &str) -> OrchestratorResult<()> {
        let span = span_operation("destroy", worker_id);
        self.require(worker_id)?;

        let needs_stop = !matches!(
            self.inner.lifecycle.state(worker_id),
            None | Some(ProcessState::Initializing | ProcessState::Stopped | ProcessState::Terminated)
        );
        if needs_stop {
            if let Err(e) = self.stop(worker_id, true).await {
                warn!(worker_id = %worker_id, error = %e, "Stop before destroy failed");
            }
        }
        if self.inner.lifecycle.state(worker_id) != Some(ProcessState::Terminated) {
            if let Err(e) = self.inner.lifecycle.terminate(worker_id).await {
                debug!(worker_id = %worker_id, error = %e, "Terminate before destroy rejected");
            }
        }

        self.inner.executor.remove(worker_id);
        self.inner.workers.remove(worker_id);
        if self.inner.lifecycle.is_registered(worker_id) {
            self.inner.lifecycle.unregister_process(worker_id)?;
        }
        if self.inner.allocator.has_allocation(worker_id) {
            self.inner.allocator.deallocate(worker_id)?;
        }
        self.inner.monitor.unregister(worker_id);
        self.inner.ipc.remove_channel(worker_id).await?;

        self.inner.metrics.inc_counter("workers.destroyed", 1.0);
        info!(worker_id = %worker_id, "Worker destroyed");
        span.record_result(true);
        Ok(())
    }

    /// One pass of the fleet monitoring loop
    ///
    /// Detects exited processes, health-checks live workers, drains the
    /// supervisor inbox and feeds sampled usage to the allocator.
    pub async fn monitor_tick(&self) {
        let mut ids: Vec<ProcessId> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        ids.sort();

        let mut checks = Vec::new();
        for id in ids {
            let Some(state) = self.inner.lifecycle.state(&id) else {
                continue;
            };
            if !state.is_live() || self.is_stopping(&id) {
                continue;
            }
            if !self.inner.executor.is_alive(&id) {
                self.handle_exit(&id).await;
                continue;
            }
            if self.health_check_due(&id) {
                checks.push(self.check_worker(id, state));
            }
        }
        join_all(checks).await;

        if let Err(e) = self.inner.ipc.process_inbox().await {
            warn!(error = %e, "Supervisor inbox scan failed");
        }

        self.feed_usage();
        self.update_gauges();
    }

    /// A live worker's process is gone
    async fn handle_exit(&self, worker_id: &str) {
        let status = self.inner.executor.exit_status(worker_id);
        let clean = status.is_some_and(|s| s.success());
        let policy = self.restart_policy(worker_id);
        self.inner.monitor.unregister(worker_id);

        if clean && !policy.restarts_clean_exit() {
            info!(worker_id = %worker_id, "Worker exited cleanly");
            let meta = json!({ "exit_code": 0 });
            match self
                .inner
                .lifecycle
                .transition(worker_id, ProcessState::Stopping, TransitionTrigger::External, meta)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .inner
                        .lifecycle
                        .complete(worker_id, TransitionTrigger::External)
                        .await
                    {
                        debug!(worker_id = %worker_id, error = %e, "Could not complete stop after exit");
                    }
                }
                Err(e) => debug!(worker_id = %worker_id, error = %e, "Could not record clean exit"),
            }
            return;
        }

        let reason = match status {
            Some(status) => format!("process exited: {}", status),
            None => "process disappeared".to_string(),
        };
        self.inner.metrics.inc_counter("workers.crashed", 1.0);
        if let Err(e) = self.inner.lifecycle.mark_failed(worker_id, reason).await {
            debug!(worker_id = %worker_id, error = %e, "Could not mark exited worker failed");
        }
    }

    fn health_check_due(&self, worker_id: &str) -> bool {
        self.inner.workers.get(worker_id).is_some_and(|r| {
            r.last_health_check
                .map_or(true, |last| last.elapsed() >= r.config.health_check_interval)
        })
    }

    /// Ping RUNNING workers; PAUSED workers cannot answer and get the default check
    async fn check_worker(&self, worker_id: ProcessId, state: ProcessState) {
        if let Some(mut record) = self.inner.workers.get_mut(&worker_id) {
            record.last_health_check = Some(Instant::now());
        }

        let result = if state == ProcessState::Paused {
            self.inner.lifecycle.perform_health_check(&worker_id).await
        } else {
            let ipc = self.inner.ipc.clone();
            let id = worker_id.clone();
            self.inner
                .lifecycle
                .perform_health_check_with(&worker_id, async move {
                    match ipc
                        .request_with_timeout(&id, "ping", json!({}), HEALTH_PING_TIMEOUT)
                        .await?
                    {
                        SendOutcome::Response(_) => Ok(true),
                        SendOutcome::Remote { error, .. } => Err(anyhow::anyhow!(error)),
                        SendOutcome::Timeout | SendOutcome::Delivered(_) => Ok(false),
                    }
                })
                .await
        };

        match result {
            Ok(true) if state == ProcessState::Running => self.collect_worker_metrics(&worker_id).await,
            Ok(_) => {}
            Err(e) => debug!(worker_id = %worker_id, error = %e, "Health check skipped"),
        }
    }

    /// Ask the worker for the figures the OS cannot attribute per process
    async fn collect_worker_metrics(&self, worker_id: &str) {
        let outcome = self
            .inner
            .ipc
            .request_with_timeout(worker_id, "metrics", json!({}), HEALTH_PING_TIMEOUT)
            .await;
        let Ok(SendOutcome::Response(reply)) = outcome else {
            return;
        };

        let field = |name: &str| reply.payload.get(name).and_then(Value::as_f64).unwrap_or(0.0);
        self.inner.monitor.report_worker_metrics(
            worker_id,
            ReportedMetrics {
                network_mbps: field("network_mbps"),
                connections: field("connections") as u32,
                threads: field("threads") as u32,
            },
        );
    }

    fn feed_usage(&self) {
        for id in self.inner.monitor.monitored() {
            if let Some(usage) = self.inner.monitor.usage(&id) {
                if let Err(e) = self.inner.allocator.record_usage(&id, usage) {
                    debug!(worker_id = %id, error = %e, "Usage sample dropped");
                }
            }
        }
    }

    fn update_gauges(&self) {
        let running = self
            .inner
            .lifecycle
            .processes_in(ProcessState::Running)
            .len();
        self.inner
            .metrics
            .set_gauge("fleet.workers", self.inner.workers.len() as f64);
        self.inner.metrics.set_gauge("fleet.running", running as f64);
    }

    pub fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        let (config, restarts, created_at) = {
            let record = self.inner.workers.get(worker_id)?;
            (record.effective().clone(), record.restarts, record.created_at)
        };
        let snapshot = self.inner.lifecycle.snapshot(worker_id)?;
        Some(WorkerInfo {
            worker_id: worker_id.to_string(),
            state: snapshot.state,
            os_pid: self.inner.executor.os_pid(worker_id),
            priority: config.priority,
            restart_policy: config.restart_policy,
            restarts,
            recovery_attempts: snapshot.recovery_attempts,
            health: Some(snapshot.health),
            allocation: self.inner.allocator.allocation(worker_id),
            created_at,
        })
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut ids: Vec<ProcessId> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.worker_info(id)).collect()
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        self.inner.workers.contains_key(worker_id)
    }

    pub fn stats(&self) -> FleetStats {
        let mut by_state = BTreeMap::new();
        for id in self.inner.lifecycle.processes() {
            if let Some(state) = self.inner.lifecycle.state(&id) {
                *by_state.entry(state.as_str().to_string()).or_insert(0) += 1;
            }
        }
        FleetStats {
            workers: self.inner.workers.len(),
            by_state,
            lifecycle: self.inner.lifecycle.stats(),
            allocator: self.inner.allocator.stats(),
            ipc: self.inner.ipc.stats(),
            alerts: self.inner.monitor.alert_count(),
            metrics: self.inner.metrics.snapshot(),
        }
    }

    pub(super) fn effective_config(&self, worker_id: &str) -> Option<WorkerConfig> {
        self.inner
            .workers
            .get(worker_id)
            .map(|r| r.effective().clone())
    }

    pub(super) fn restart_policy(&self, worker_id: &str) -> RestartPolicy {
        self.inner
            .workers
            .get(worker_id)
            .map(|r| r.config.restart_policy)
            .unwrap_or_default()
    }

    pub(super) fn set_stopping(&self, worker_id: &str, stopping: bool) {
        if let Some(mut record) = self.inner.workers.get_mut(worker_id) {
            record.stopping = stopping;
        }
    }

    fn is_stopping(&self, worker_id: &str) -> bool {
        self.inner.workers.get(worker_id).is_some_and(|r| r.stopping)
    }

    pub(super) fn require(&self, worker_id: &str) -> OrchestratorResult<()> {
        if self.inner.workers.contains_key(worker_id) {
            Ok(())
        } else {
            Err(OrchestratorError::WorkerNotFound(worker_id.to_string()))
        }
    }

    pub(super) fn ensure_open(&self) -> OrchestratorResult<()> {
        if self.is_closed() {
            Err(OrchestratorError::Config("orchestrator is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Route a supervisor-side failure into the lifecycle manager
    pub(super) async fn fail(&self, worker_id: &str, error: &OrchestratorError) {
        warn!(worker_id = %worker_id, error = %error, kind = error.as_label(), "Worker operation failed");
        if let Err(e) = self
            .inner
            .lifecycle
            .mark_failed(worker_id, error.to_string())
            .await
        {
            debug!(worker_id = %worker_id, error = %e, "Could not mark worker failed");
        }
    }
}
