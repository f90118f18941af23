/*!
 * Process Monitor
 * OS-level sampling of worker processes plus threshold alerts
 *
 * CPU, resident memory, disk throughput and liveness come from `sysinfo`.
 * Network throughput, connection and thread counts cannot be attributed per
 * process portably; workers report them in their `metrics` reply and the
 * supervisor feeds them in through `report_worker_metrics`.
 */

use super::metrics::MetricsCollector;
use crate::core::limits::{ALERT_HISTORY_LIMIT, MONITOR_INTERVAL};
use crate::core::task::{self, LoopTask};
use crate::core::types::{now_micros, ProcessId, Timestamp};
use crate::resources::ResourceUsage;
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-process gauges published by each sample
const PROCESS_GAUGES: [&str; 2] = ["cpu_percent", "memory_mb"];

fn process_gauge(process_id: &str, gauge: &str) -> String {
    format!("process.{}.{}", process_id, gauge)
}

/// Alert thresholds; a value at or above a threshold raises the alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
    /// Consecutive samples that could not find the process
    pub max_failed_samples: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 95.0,
            memory_warning_mb: 1024.0,
            memory_critical_mb: 2048.0,
            max_failed_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Cpu,
    Memory,
    SampleFailures,
    ProcessDead,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Cpu => "cpu",
            AlertKind::Memory => "memory",
            AlertKind::SampleFailures => "sample_failures",
            AlertKind::ProcessDead => "process_dead",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub process_id: ProcessId,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: Timestamp,
}

/// Receives every alert as it is raised
pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

/// OS view of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Zombie,
    Dead,
    /// Not found in the OS process table
    Missing,
}

impl Liveness {
    pub fn is_gone(self) -> bool {
        !matches!(self, Liveness::Alive)
    }
}

/// One OS sample of a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub process_id: ProcessId,
    pub os_pid: u32,
    pub liveness: Liveness,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_read_mbps: f64,
    pub disk_write_mbps: f64,
    pub sampled_at: Timestamp,
}

/// Values only the worker itself can report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedMetrics {
    pub network_mbps: f64,
    pub connections: u32,
    pub threads: u32,
}

struct Monitored {
    os_pid: u32,
    last: Option<ProcessMetrics>,
    last_sampled: Option<Instant>,
    failed_samples: u32,
    reported: ReportedMetrics,
}

/// Pure threshold evaluation: (kind, severity, value, threshold) for every breach
pub fn evaluate_thresholds(
    thresholds: &AlertThresholds,
    metrics: &ProcessMetrics,
    failed_samples: u32,
) -> Vec<(AlertKind, AlertSeverity, f64, f64)> {
    let mut out = Vec::new();

    if matches!(metrics.liveness, Liveness::Zombie | Liveness::Dead) {
        out.push((AlertKind::ProcessDead, AlertSeverity::Critical, 1.0, 0.0));
    }

    if failed_samples > 0 && failed_samples == thresholds.max_failed_samples {
        out.push((
            AlertKind::SampleFailures,
            AlertSeverity::Critical,
            f64::from(failed_samples),
            f64::from(thresholds.max_failed_samples),
        ));
    }

    if metrics.liveness == Liveness::Alive {
        if metrics.cpu_percent >= thresholds.cpu_critical_percent {
            out.push((AlertKind::Cpu, AlertSeverity::Critical, metrics.cpu_percent, thresholds.cpu_critical_percent));
        } else if metrics.cpu_percent >= thresholds.cpu_warning_percent {
            out.push((AlertKind::Cpu, AlertSeverity::Warning, metrics.cpu_percent, thresholds.cpu_warning_percent));
        }

        if metrics.memory_mb >= thresholds.memory_critical_mb {
            out.push((AlertKind::Memory, AlertSeverity::Critical, metrics.memory_mb, thresholds.memory_critical_mb));
        } else if metrics.memory_mb >= thresholds.memory_warning_mb {
            out.push((AlertKind::Memory, AlertSeverity::Warning, metrics.memory_mb, thresholds.memory_warning_mb));
        }
    }
    out
}

/// Process monitor handle; cheap to clone
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    thresholds: RwLock<AlertThresholds>,
    system: Mutex<System>,
    processes: DashMap<ProcessId, Monitored, RandomState>,
    alerts: Mutex<VecDeque<Alert>>,
    callback: RwLock<Option<AlertCallback>>,
    metrics: MetricsCollector,
    tasks: Mutex<Vec<LoopTask>>,
    closed: AtomicBool,
}

impl ProcessMonitor {
    pub fn new(thresholds: AlertThresholds, metrics: MetricsCollector) -> Self {
        info!("Process monitor initialized");
        Self {
            inner: Arc::new(MonitorInner {
                thresholds: RwLock::new(thresholds),
                system: Mutex::new(System::new()),
                processes: DashMap::with_hasher(RandomState::new()),
                alerts: Mutex::new(VecDeque::with_capacity(ALERT_HISTORY_LIMIT)),
                callback: RwLock::new(None),
                metrics,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.inner.thresholds.read().clone()
    }

    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.inner.thresholds.write() = thresholds;
    }

    pub fn set_alert_callback(&self, callback: AlertCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    /// Start watching `os_pid` under `process_id`, replacing any previous pid
    pub fn register(&self, process_id: &str, os_pid: u32) {
        self.inner.processes.insert(
            process_id.to_string(),
            Monitored {
                os_pid,
                last: None,
                last_sampled: None,
                failed_samples: 0,
                reported: ReportedMetrics::default(),
            },
        );
        debug!(process_id = %process_id, os_pid, "Process registered with monitor");
    }

    pub fn unregister(&self, process_id: &str) -> bool {
        let removed = self.inner.processes.remove(process_id).is_some();
        if removed {
            for gauge in PROCESS_GAUGES {
                self.inner.metrics.remove_gauge(&process_gauge(process_id, gauge));
            }
            debug!(process_id = %process_id, "Process unregistered from monitor");
        }
        removed
    }

    pub fn is_registered(&self, process_id: &str) -> bool {
        self.inner.processes.contains_key(process_id)
    }

    pub fn os_pid(&self, process_id: &str) -> Option<u32> {
        self.inner.processes.get(process_id).map(|m| m.os_pid)
    }

    pub fn monitored(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.inner.processes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Merge worker-reported values into subsequent usage samples
    pub fn report_worker_metrics(&self, process_id: &str, reported: ReportedMetrics) -> bool {
        match self.inner.processes.get_mut(process_id) {
            Some(mut entry) => {
                entry.reported = reported;
                true
            }
            None => false,
        }
    }

    /// Take one OS sample of `process_id`
    pub fn sample(&self, process_id: &str) -> Option<ProcessMetrics> {
        let (os_pid, previous) = {
            let entry = self.inner.processes.get(process_id)?;
            (entry.os_pid, entry.last_sampled)
        };

        let now = Instant::now();
        let metrics = {
            let mut system = self.inner.system.lock();
            let pid = Pid::from_u32(os_pid);
            let found = system.refresh_process(pid);
            let elapsed = previous
                .map(|p| now.duration_since(p).as_secs_f64())
                .filter(|s| *s > 0.0);

            match system.process(pid).filter(|_| found) {
                Some(process) => {
                    let disk = process.disk_usage();
                    let rate = |bytes: u64| elapsed.map_or(0.0, |s| bytes as f64 * 8.0 / 1_000_000.0 / s);
                    ProcessMetrics {
                        process_id: process_id.to_string(),
                        os_pid,
                        liveness: match process.status() {
                            ProcessStatus::Zombie => Liveness::Zombie,
                            ProcessStatus::Dead => Liveness::Dead,
                            _ => Liveness::Alive,
                        },
                        cpu_percent: f64::from(process.cpu_usage()),
                        memory_mb: process.memory() as f64 / BYTES_PER_MB,
                        disk_read_mbps: rate(disk.read_bytes),
                        disk_write_mbps: rate(disk.written_bytes),
                        sampled_at: now_micros(),
                    }
                }
                None => ProcessMetrics {
                    process_id: process_id.to_string(),
                    os_pid,
                    liveness: Liveness::Missing,
                    cpu_percent: 0.0,
                    memory_mb: 0.0,
                    disk_read_mbps: 0.0,
                    disk_write_mbps: 0.0,
                    sampled_at: now_micros(),
                },
            }
        };

        let failed_samples = {
            let mut entry = self.inner.processes.get_mut(process_id)?;
            if metrics.liveness == Liveness::Missing {
                entry.failed_samples += 1;
            } else {
                entry.failed_samples = 0;
            }
            entry.last = Some(metrics.clone());
            entry.last_sampled = Some(now);
            entry.failed_samples
        };

        let [cpu, memory] = PROCESS_GAUGES;
        self.inner
            .metrics
            .set_gauge(&process_gauge(process_id, cpu), metrics.cpu_percent);
        self.inner
            .metrics
            .set_gauge(&process_gauge(process_id, memory), metrics.memory_mb);

        let breaches = evaluate_thresholds(&self.inner.thresholds.read(), &metrics, failed_samples);
        for (kind, severity, value, threshold) in breaches {
            self.raise(process_id, kind, severity, value, threshold);
        }
        Some(metrics)
    }

    /// Sample every registered process
    pub fn sample_all(&self) -> Vec<ProcessMetrics> {
        self.monitored()
            .iter()
            .filter_map(|id| self.sample(id))
            .collect()
    }

    pub fn last_sample(&self, process_id: &str) -> Option<ProcessMetrics> {
        self.inner
            .processes
            .get(process_id)
            .and_then(|m| m.last.clone())
    }

    /// Latest OS sample merged with worker-reported values, as allocator usage
    pub fn usage(&self, process_id: &str) -> Option<ResourceUsage> {
        let entry = self.inner.processes.get(process_id)?;
        let last = entry.last.as_ref()?;
        if last.liveness.is_gone() {
            return None;
        }
        Some(ResourceUsage {
            cpu_percent: last.cpu_percent,
            memory_mb: last.memory_mb,
            network_mbps: entry.reported.network_mbps,
            disk_io_mbps: last.disk_read_mbps + last.disk_write_mbps,
            connections: entry.reported.connections,
            threads: entry.reported.threads,
            timestamp: last.sampled_at,
        })
    }

    fn raise(&self, process_id: &str, kind: AlertKind, severity: AlertSeverity, value: f64, threshold: f64) {
        let alert = Alert {
            id: Uuid::new_v4(),
            process_id: process_id.to_string(),
            kind,
            severity,
            value,
            threshold,
            message: format!("{} {:.1} reached threshold {:.1}", kind, value, threshold),
            timestamp: now_micros(),
        };

        match severity {
            AlertSeverity::Critical => error!(process_id = %process_id, kind = %kind, value, threshold, "Critical alert"),
            AlertSeverity::Warning => warn!(process_id = %process_id, kind = %kind, value, threshold, "Warning alert"),
        }
        self.inner
            .metrics
            .inc_counter(&format!("alerts.{}", kind), 1.0);

        {
            let mut alerts = self.inner.alerts.lock();
            if alerts.len() >= ALERT_HISTORY_LIMIT {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }

        let callback = self.inner.callback.read().clone();
        if let Some(callback) = callback {
            callback(&alert);
        }
    }

    /// Most recent alerts, newest last
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.inner.alerts.lock();
        let skip = alerts.len().saturating_sub(limit);
        alerts.iter().skip(skip).cloned().collect()
    }

    pub fn alert_count(&self) -> usize {
        self.inner.alerts.lock().len()
    }

    pub fn clear_alerts(&self) {
        self.inner.alerts.lock().clear();
    }

    /// Spawn the periodic sampling loop
    pub fn start(&self, interval: Duration) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let interval = if interval.is_zero() { MONITOR_INTERVAL } else { interval };
        let weak = Arc::downgrade(&self.inner);
        tasks.push(LoopTask::spawn("process-sampler", interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    ProcessMonitor { inner }.sample_all();
                }
                Ok(())
            }
        }));
    }

    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        task::shutdown_all(tasks).await;
        self.inner.processes.clear();
        info!("Process monitor shut down");
    }
}
