/*!
 * Resource Types
 * Budget dimensions, allocations and reallocation records
 */

use crate::core::limits::{ADAPTIVE_TARGET_UTILIZATION, USAGE_HISTORY_LIMIT};
use crate::core::types::{now_micros, Priority, ProcessId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Tolerance for floating-point ceiling comparisons
pub(crate) const EPSILON: f64 = 1e-9;

/// One budget dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Network,
    DiskIo,
    Connections,
    Threads,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Network,
        ResourceKind::DiskIo,
        ResourceKind::Connections,
        ResourceKind::Threads,
    ];

    /// Whether the dimension is counted in whole units
    #[inline]
    pub fn is_integral(self) -> bool {
        matches!(self, ResourceKind::Connections | ResourceKind::Threads)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu_percent",
            ResourceKind::Memory => "memory_mb",
            ResourceKind::Network => "network_mbps",
            ResourceKind::DiskIo => "disk_io_mbps",
            ResourceKind::Connections => "max_connections",
            ResourceKind::Threads => "max_threads",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget granted to one worker, or the global ceiling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_mbps: f64,
    pub disk_io_mbps: f64,
    pub max_connections: u32,
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    /// Per-worker baseline
    fn default() -> Self {
        Self {
            cpu_percent: 25.0,
            memory_mb: 256.0,
            network_mbps: 50.0,
            disk_io_mbps: 25.0,
            max_connections: 100,
            max_threads: 16,
        }
    }
}

impl ResourceLimits {
    pub const fn zero() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0.0,
            network_mbps: 0.0,
            disk_io_mbps: 0.0,
            max_connections: 0,
            max_threads: 0,
        }
    }

    /// Host-wide ceiling used when none is configured
    pub const fn system_default() -> Self {
        Self {
            cpu_percent: 400.0,
            memory_mb: 8192.0,
            network_mbps: 1000.0,
            disk_io_mbps: 500.0,
            max_connections: 10_000,
            max_threads: 1024,
        }
    }

    #[must_use]
    pub fn with_cpu(mut self, cpu_percent: f64) -> Self {
        self.cpu_percent = cpu_percent;
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory_mb: f64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Network => self.network_mbps,
            ResourceKind::DiskIo => self.disk_io_mbps,
            ResourceKind::Connections => f64::from(self.max_connections),
            ResourceKind::Threads => f64::from(self.max_threads),
        }
    }

    /// Set one dimension; integral dimensions are floored and negatives clamp to zero
    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        let value = value.max(0.0);
        match kind {
            ResourceKind::Cpu => self.cpu_percent = value,
            ResourceKind::Memory => self.memory_mb = value,
            ResourceKind::Network => self.network_mbps = value,
            ResourceKind::DiskIo => self.disk_io_mbps = value,
            ResourceKind::Connections => self.max_connections = whole_units(value),
            ResourceKind::Threads => self.max_threads = whole_units(value),
        }
    }

    /// Every dimension multiplied by `factor`
    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        self.map(|_, v| v * factor)
    }

    /// Apply `f` to every dimension
    #[must_use]
    pub fn map(&self, mut f: impl FnMut(ResourceKind, f64) -> f64) -> Self {
        let mut out = *self;
        for kind in ResourceKind::ALL {
            out.set(kind, f(kind, self.get(kind)));
        }
        out
    }

    /// Component-wise sum
    #[must_use]
    pub fn plus(&self, other: &ResourceLimits) -> Self {
        self.map(|kind, v| v + other.get(kind))
    }

    /// Component-wise difference, floored at zero
    #[must_use]
    pub fn minus(&self, other: &ResourceLimits) -> Self {
        self.map(|kind, v| v - other.get(kind))
    }

    /// Component-wise minimum
    #[must_use]
    pub fn min(&self, other: &ResourceLimits) -> Self {
        self.map(|kind, v| v.min(other.get(kind)))
    }

    /// First dimension where `self` exceeds `ceiling`
    pub fn first_excess(&self, ceiling: &ResourceLimits) -> Option<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| self.get(*kind) > ceiling.get(*kind) + EPSILON)
    }

    pub fn fits_within(&self, ceiling: &ResourceLimits) -> bool {
        self.first_excess(ceiling).is_none()
    }

    /// First dimension that is negative or not a finite number
    pub fn first_invalid(&self) -> Option<ResourceKind> {
        ResourceKind::ALL.into_iter().find(|kind| {
            let value = self.get(*kind);
            !value.is_finite() || value < 0.0
        })
    }

    /// Reject limits no admission check can sum safely
    pub fn validate(&self) -> Result<(), String> {
        match self.first_invalid() {
            None => Ok(()),
            Some(kind) => Err(format!("{} must be a finite non-negative number, got {}", kind, self.get(kind))),
        }
    }

    /// Every dimension strictly positive
    pub fn is_positive(&self) -> bool {
        ResourceKind::ALL.into_iter().all(|kind| self.get(kind) > 0.0)
    }
}

fn whole_units(value: f64) -> u32 {
    (value + EPSILON).floor().min(f64::from(u32::MAX)) as u32
}

/// Measured consumption of one worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_mbps: f64,
    pub disk_io_mbps: f64,
    pub connections: u32,
    pub threads: u32,
    pub timestamp: Timestamp,
}

impl ResourceUsage {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Network => self.network_mbps,
            ResourceKind::DiskIo => self.disk_io_mbps,
            ResourceKind::Connections => f64::from(self.connections),
            ResourceKind::Threads => f64::from(self.threads),
        }
    }

    /// Dimensions where usage exceeds `limits`
    pub fn violations(&self, limits: &ResourceLimits) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind) > limits.get(*kind) + EPSILON)
            .collect()
    }
}

/// Average utilization (usage / limit) per dimension over the usage history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub disk_io: f64,
    pub connections: f64,
    pub threads: f64,
    pub samples: usize,
}

impl ResourceUtilization {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Network => self.network,
            ResourceKind::DiskIo => self.disk_io,
            ResourceKind::Connections => self.connections,
            ResourceKind::Threads => self.threads,
        }
    }

    fn set(&mut self, kind: ResourceKind, value: f64) {
        match kind {
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Memory => self.memory = value,
            ResourceKind::Network => self.network = value,
            ResourceKind::DiskIo => self.disk_io = value,
            ResourceKind::Connections => self.connections = value,
            ResourceKind::Threads => self.threads = value,
        }
    }

    /// Mean over all dimensions
    pub fn mean(&self) -> f64 {
        ResourceKind::ALL.iter().map(|k| self.get(*k)).sum::<f64>() / ResourceKind::ALL.len() as f64
    }
}

/// One worker's grant plus its observed behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceAllocation {
    pub process_id: ProcessId,
    pub priority: Priority,
    pub limits: ResourceLimits,
    /// What was asked for; differs from `limits` after a reduced grant
    pub requested: ResourceLimits,
    pub usage: ResourceUsage,
    #[serde(skip)]
    pub history: VecDeque<ResourceUsage>,
    /// Violations since the last optimization pass
    pub violations: u32,
    pub total_violations: u64,
    pub performance_score: f64,
    pub allocated_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ResourceAllocation {
    pub fn new(process_id: impl Into<ProcessId>, priority: Priority, limits: ResourceLimits, requested: ResourceLimits) -> Self {
        let now = now_micros();
        Self {
            process_id: process_id.into(),
            priority,
            limits,
            requested,
            usage: ResourceUsage::default(),
            history: VecDeque::with_capacity(USAGE_HISTORY_LIMIT),
            violations: 0,
            total_violations: 0,
            performance_score: 1.0,
            allocated_at: now,
            updated_at: now,
        }
    }

    /// Append a sample; returns the dimensions it violates
    pub fn record_usage(&mut self, usage: ResourceUsage) -> Vec<ResourceKind> {
        if self.history.len() >= USAGE_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(usage);
        self.usage = usage;
        self.updated_at = now_micros();

        let violated = usage.violations(&self.limits);
        if !violated.is_empty() {
            self.violations += 1;
            self.total_violations += 1;
        }
        violated
    }

    /// Average usage / limit per dimension over the history
    pub fn utilization(&self) -> ResourceUtilization {
        let mut out = ResourceUtilization {
            samples: self.history.len(),
            ..ResourceUtilization::default()
        };
        if self.history.is_empty() {
            return out;
        }
        for kind in ResourceKind::ALL {
            let limit = self.limits.get(kind);
            if limit <= 0.0 {
                continue;
            }
            let mean = self.history.iter().map(|u| u.get(kind)).sum::<f64>() / self.history.len() as f64;
            out.set(kind, mean / limit);
        }
        out
    }

    /// Blend of violation rate and closeness of utilization to the target
    pub fn compute_performance_score(&self) -> f64 {
        let violation_part = 1.0 - (f64::from(self.violations) / 10.0).min(1.0);
        let utilization = self.utilization();
        let closeness = if utilization.samples == 0 {
            1.0
        } else {
            let distance = (utilization.mean() - ADAPTIVE_TARGET_UTILIZATION).abs();
            (1.0 - distance / ADAPTIVE_TARGET_UTILIZATION).clamp(0.0, 1.0)
        };
        0.5 * violation_part + 0.5 * closeness
    }
}

/// Allocation policy used by `optimize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Even split of the ceiling across active workers
    Equal,
    /// Baseline scaled by the priority multiplier
    Priority,
    /// Workers of one priority tier rebalanced to the tier average
    FairShare,
    /// Per-dimension shrink or grow from observed utilization
    #[default]
    Adaptive,
}

impl AllocationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::Equal => "equal",
            AllocationStrategy::Priority => "priority",
            AllocationStrategy::FairShare => "fair_share",
            AllocationStrategy::Adaptive => "adaptive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "equal" => Some(AllocationStrategy::Equal),
            "priority" => Some(AllocationStrategy::Priority),
            "fair_share" | "fairshare" => Some(AllocationStrategy::FairShare),
            "adaptive" => Some(AllocationStrategy::Adaptive),
            _ => None,
        }
    }
}

/// Audit record of one limit change attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReallocationRecord {
    pub process_id: ProcessId,
    pub before: ResourceLimits,
    pub after: ResourceLimits,
    pub reason: String,
    pub success: bool,
    pub timestamp: Timestamp,
}

/// Outcome of one `optimize` pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptimizationReport {
    pub strategy: Option<AllocationStrategy>,
    pub considered: usize,
    pub applied: usize,
    pub rejected: usize,
}

/// Allocator statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocatorStats {
    pub strategy: AllocationStrategy,
    pub allocations: usize,
    pub capacity: ResourceLimits,
    pub total_allocated: ResourceLimits,
    pub available: ResourceLimits,
    pub reduced_grants: u64,
    pub rejected: u64,
    pub optimizations: u64,
    pub reallocations: u64,
    pub failed_reallocations: u64,
    pub violations: u64,
}
