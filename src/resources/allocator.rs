/*!
 * Resource Allocator
 * Admission control of per-worker budgets against a global ceiling
 *
 * Invariant: for every dimension, the sum of all granted limits never
 * exceeds the configured capacity. Every path that changes limits (initial
 * grant, manual update, optimization) goes through the same admission
 * check, with rollback when the new limits do not fit.
 *
 * The allocation table sits behind one mutex that is never held across
 * an await point.
 */

use super::strategy::{self, PlannedChange};
use super::types::{
    AllocationStrategy, AllocatorStats, OptimizationReport, ReallocationRecord, ResourceAllocation,
    ResourceLimits, ResourceUsage, ResourceUtilization,
};
use crate::core::errors::{ResourceError, ResourceResult};
use crate::core::limits::{OPTIMIZE_INTERVAL, REALLOCATION_HISTORY_LIMIT, REDUCED_GRANT_FRACTION};
use crate::core::task::{self, LoopTask};
use crate::core::types::{now_micros, Priority, ProcessId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Global ceiling
    pub capacity: ResourceLimits,
    /// Request used when none is given, before the priority multiplier
    pub default_limits: ResourceLimits,
    pub strategy: AllocationStrategy,
    pub optimize_interval: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            capacity: ResourceLimits::system_default(),
            default_limits: ResourceLimits::default(),
            strategy: AllocationStrategy::default(),
            optimize_interval: OPTIMIZE_INTERVAL,
        }
    }
}

impl AllocatorConfig {
    #[must_use]
    pub fn with_capacity(mut self, capacity: ResourceLimits) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Default)]
struct Counters {
    reduced_grants: u64,
    rejected: u64,
    optimizations: u64,
    reallocations: u64,
    failed_reallocations: u64,
    violations: u64,
}

struct AllocatorState {
    strategy: AllocationStrategy,
    allocations: HashMap<ProcessId, ResourceAllocation>,
    history: VecDeque<ReallocationRecord>,
    counters: Counters,
}

impl AllocatorState {
    /// Sum of all granted limits, optionally leaving one allocation out
    fn total_except(&self, exclude: Option<&str>) -> ResourceLimits {
        self.allocations
            .values()
            .filter(|a| Some(a.process_id.as_str()) != exclude)
            .fold(ResourceLimits::zero(), |acc, a| acc.plus(&a.limits))
    }

    /// Admission check: existing grants (minus `exclude`) plus `request` within `capacity`
    fn admit(&self, capacity: &ResourceLimits, request: &ResourceLimits, exclude: Option<&str>) -> Result<(), String> {
        let total = self.total_except(exclude).plus(request);
        match total.first_excess(capacity) {
            None => Ok(()),
            Some(kind) => Err(format!(
                "{} would reach {:.1} of {:.1}",
                kind,
                total.get(kind),
                capacity.get(kind)
            )),
        }
    }

    fn log(&mut self, record: ReallocationRecord) {
        if self.history.len() >= REALLOCATION_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Swap one allocation's limits through admission; rolls back on failure
    fn reallocate(&mut self, capacity: &ResourceLimits, process_id: &str, limits: ResourceLimits, reason: &str) -> bool {
        let Some(before) = self.allocations.get(process_id).map(|a| a.limits) else {
            return false;
        };

        // Old limits are released by excluding them from the sum
        let admitted = self.admit(capacity, &limits, Some(process_id));
        let success = admitted.is_ok();
        if let Some(alloc) = self.allocations.get_mut(process_id) {
            alloc.limits = if success { limits } else { before };
            alloc.updated_at = now_micros();
        }

        if success {
            self.counters.reallocations += 1;
            debug!(process_id = %process_id, reason = %reason, "Limits reallocated");
        } else {
            self.counters.failed_reallocations += 1;
            debug!(process_id = %process_id, reason = %reason, "Reallocation rejected; limits restored");
        }

        self.log(ReallocationRecord {
            process_id: process_id.to_string(),
            before,
            after: if success { limits } else { before },
            reason: match admitted {
                Ok(()) => reason.to_string(),
                Err(why) => format!("{} (rejected: {})", reason, why),
            },
            success,
            timestamp: now_micros(),
        });
        success
    }
}

/// Resource allocator handle; cheap to clone
#[derive(Clone)]
pub struct ResourceAllocator {
    inner: Arc<AllocatorInner>,
}

struct AllocatorInner {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    tasks: Mutex<Vec<LoopTask>>,
    closed: AtomicBool,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        info!(
            strategy = config.strategy.as_str(),
            cpu = config.capacity.cpu_percent,
            memory_mb = config.capacity.memory_mb,
            "Resource allocator initialized"
        );
        let strategy = config.strategy;
        Self {
            inner: Arc::new(AllocatorInner {
                config,
                state: Mutex::new(AllocatorState {
                    strategy,
                    allocations: HashMap::new(),
                    history: VecDeque::new(),
                    counters: Counters::default(),
                }),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> ResourceLimits {
        self.inner.config.capacity
    }

    /// Default request for `priority`
    pub fn default_request(&self, priority: Priority) -> ResourceLimits {
        self.inner
            .config
            .default_limits
            .scale(priority.multiplier())
    }

    /// Grant a budget to `process_id`
    ///
    /// If the request does not fit, one optimization pass runs and the
    /// request is retried; failing that a reduced grant is tried. Only when
    /// the reduced grant also does not fit is the allocation refused.
    pub fn allocate(
        &self,
        process_id: &str,
        priority: Priority,
        requested: Option<ResourceLimits>,
    ) -> ResourceResult<ResourceAllocation> {
        let capacity = self.inner.config.capacity;
        let request = requested.unwrap_or_else(|| self.default_request(priority));
        request.validate().map_err(|reason| ResourceError::InvalidLimits {
            process_id: process_id.to_string(),
            reason,
        })?;
        let mut state = self.inner.state.lock();

        if state.allocations.contains_key(process_id) {
            return Err(ResourceError::AlreadyAllocated(process_id.to_string()));
        }

        let mut granted = None;
        let mut reason = String::from("allocate");

        if state.admit(&capacity, &request, None).is_ok() {
            granted = Some(request);
        } else {
            let report = Self::optimize_locked(&mut state, &self.inner.config, 1);
            debug!(process_id = %process_id, applied = report.applied, "Optimized before admission retry");

            if state.admit(&capacity, &request, None).is_ok() {
                granted = Some(request);
                reason = String::from("allocate after optimization");
            } else {
                let reduced = request.scale(REDUCED_GRANT_FRACTION);
                match state.admit(&capacity, &reduced, None) {
                    Ok(()) => {
                        warn!(
                            process_id = %process_id,
                            fraction = REDUCED_GRANT_FRACTION,
                            "Granting reduced allocation"
                        );
                        state.counters.reduced_grants += 1;
                        granted = Some(reduced);
                        reason = format!("reduced allocation ({}%)", (REDUCED_GRANT_FRACTION * 100.0) as u32);
                    }
                    Err(why) => {
                        state.counters.rejected += 1;
                        warn!(process_id = %process_id, reason = %why, "Allocation infeasible");
                        return Err(ResourceError::Infeasible {
                            process_id: process_id.to_string(),
                            reason: why,
                        });
                    }
                }
            }
        }

        let limits = granted.unwrap_or(request);
        let allocation = ResourceAllocation::new(process_id, priority, limits, request);
        state
            .allocations
            .insert(process_id.to_string(), allocation.clone());
        state.log(ReallocationRecord {
            process_id: process_id.to_string(),
            before: ResourceLimits::zero(),
            after: limits,
            reason,
            success: true,
            timestamp: now_micros(),
        });

        info!(
            process_id = %process_id,
            priority = %priority,
            cpu = limits.cpu_percent,
            memory_mb = limits.memory_mb,
            "Resources allocated"
        );
        Ok(allocation)
    }

    /// Release the budget of `process_id`
    pub fn deallocate(&self, process_id: &str) -> ResourceResult<ResourceAllocation> {
        let mut state = self.inner.state.lock();
        let allocation = state
            .allocations
            .remove(process_id)
            .ok_or_else(|| ResourceError::NotAllocated(process_id.to_string()))?;
        state.log(ReallocationRecord {
            process_id: process_id.to_string(),
            before: allocation.limits,
            after: ResourceLimits::zero(),
            reason: "deallocate".into(),
            success: true,
            timestamp: now_micros(),
        });
        info!(process_id = %process_id, "Resources deallocated");
        Ok(allocation)
    }

    /// Replace the limits of `process_id`; `Ok(false)` when they do not fit
    ///
    /// Negative or non-finite limits are refused with `InvalidLimits`.
    pub fn update(&self, process_id: &str, limits: ResourceLimits) -> ResourceResult<bool> {
        self.update_with_reason(process_id, limits, "manual update")
    }

    pub fn update_with_reason(&self, process_id: &str, limits: ResourceLimits, reason: &str) -> ResourceResult<bool> {
        limits.validate().map_err(|why| ResourceError::InvalidLimits {
            process_id: process_id.to_string(),
            reason: why,
        })?;
        let mut state = self.inner.state.lock();
        if !state.allocations.contains_key(process_id) {
            return Err(ResourceError::NotAllocated(process_id.to_string()));
        }
        Ok(state.reallocate(&self.inner.config.capacity, process_id, limits, reason))
    }

    /// Feed one usage sample; returns the number of violated dimensions
    pub fn record_usage(&self, process_id: &str, usage: ResourceUsage) -> ResourceResult<usize> {
        let mut state = self.inner.state.lock();
        let alloc = state
            .allocations
            .get_mut(process_id)
            .ok_or_else(|| ResourceError::NotAllocated(process_id.to_string()))?;
        let violated = alloc.record_usage(usage);
        if !violated.is_empty() {
            state.counters.violations += 1;
            debug!(process_id = %process_id, dimensions = ?violated, "Usage exceeds limits");
        }
        Ok(violated.len())
    }

    /// Rebalance every allocation under the current strategy
    pub fn optimize(&self) -> OptimizationReport {
        let mut state = self.inner.state.lock();
        Self::optimize_locked(&mut state, &self.inner.config, 0)
    }

    /// One rebalancing pass; `pending` newcomers are planned for but not yet granted
    fn optimize_locked(state: &mut AllocatorState, config: &AllocatorConfig, pending: usize) -> OptimizationReport {
        let strategy = state.strategy;
        let mut changes: Vec<PlannedChange> = {
            let mut allocations: Vec<&ResourceAllocation> = state.allocations.values().collect();
            allocations.sort_by(|a, b| a.process_id.cmp(&b.process_id));
            strategy::plan(strategy, &allocations, &config.capacity, &config.default_limits, pending)
        };

        let mut report = OptimizationReport {
            strategy: Some(strategy),
            considered: state.allocations.len(),
            ..OptimizationReport::default()
        };

        // Shrinks first so freed capacity is available to the growers
        for change in changes.iter().filter(|c| c.shrinks()) {
            let step = change.shrink_step();
            if state.reallocate(&config.capacity, &change.process_id, step, &change.reason) {
                if !change.grows() {
                    report.applied += 1;
                }
            } else {
                report.rejected += 1;
            }
        }

        // Most-violating allocations grow first
        changes.sort_by(|a, b| b.violations.cmp(&a.violations).then_with(|| a.process_id.cmp(&b.process_id)));
        for change in changes.iter().filter(|c| c.grows()) {
            if state.reallocate(&config.capacity, &change.process_id, change.target, &change.reason) {
                report.applied += 1;
            } else {
                report.rejected += 1;
            }
        }

        for alloc in state.allocations.values_mut() {
            alloc.performance_score = alloc.compute_performance_score();
            alloc.violations = 0;
        }
        state.counters.optimizations += 1;

        if report.applied > 0 || report.rejected > 0 {
            info!(
                strategy = strategy.as_str(),
                applied = report.applied,
                rejected = report.rejected,
                "Optimization pass complete"
            );
        }
        report
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.inner.state.lock().strategy
    }

    pub fn set_strategy(&self, strategy: AllocationStrategy) {
        let mut state = self.inner.state.lock();
        if state.strategy != strategy {
            info!(from = state.strategy.as_str(), to = strategy.as_str(), "Allocation strategy changed");
            state.strategy = strategy;
        }
    }

    pub fn allocation(&self, process_id: &str) -> Option<ResourceAllocation> {
        self.inner.state.lock().allocations.get(process_id).cloned()
    }

    pub fn allocations(&self) -> Vec<ResourceAllocation> {
        let mut out: Vec<_> = self.inner.state.lock().allocations.values().cloned().collect();
        out.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        out
    }

    pub fn has_allocation(&self, process_id: &str) -> bool {
        self.inner.state.lock().allocations.contains_key(process_id)
    }

    pub fn utilization(&self, process_id: &str) -> Option<ResourceUtilization> {
        self.inner
            .state
            .lock()
            .allocations
            .get(process_id)
            .map(ResourceAllocation::utilization)
    }

    pub fn total_allocated(&self) -> ResourceLimits {
        self.inner.state.lock().total_except(None)
    }

    /// Capacity not yet granted
    pub fn available(&self) -> ResourceLimits {
        self.inner.config.capacity.minus(&self.total_allocated())
    }

    /// Most recent reallocation records, newest last
    pub fn history(&self, limit: usize) -> Vec<ReallocationRecord> {
        let state = self.inner.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.inner.state.lock();
        let total = state.total_except(None);
        AllocatorStats {
            strategy: state.strategy,
            allocations: state.allocations.len(),
            capacity: self.inner.config.capacity,
            total_allocated: total,
            available: self.inner.config.capacity.minus(&total),
            reduced_grants: state.counters.reduced_grants,
            rejected: state.counters.rejected,
            optimizations: state.counters.optimizations,
            reallocations: state.counters.reallocations,
            failed_reallocations: state.counters.failed_reallocations,
            violations: state.counters.violations,
        }
    }

    /// Spawn the periodic optimization loop
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tasks.push(LoopTask::spawn(
            "resource-optimizer",
            self.inner.config.optimize_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ResourceAllocator { inner }.optimize();
                    }
                    Ok(())
                }
            },
        ));
    }

    /// Stop the optimization loop and release every allocation
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        task::shutdown_all(tasks).await;

        let released = {
            let mut state = self.inner.state.lock();
            let n = state.allocations.len();
            state.allocations.clear();
            n
        };
        info!(released, "Resource allocator shut down");
    }
}
