/*!
 * Allocation Strategies
 * Pure planning: each strategy proposes target limits, the allocator
 * admits or rejects them
 */

use super::types::{AllocationStrategy, ResourceAllocation, ResourceKind, ResourceLimits, EPSILON};
use crate::core::limits::{
    ADAPTIVE_HIGH_UTILIZATION, ADAPTIVE_LOW_UTILIZATION, ADAPTIVE_MIN_FRACTION, ADAPTIVE_STEP,
};
use crate::core::types::{Priority, ProcessId};
use std::collections::BTreeMap;

/// Proposed new limits for one allocation
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub process_id: ProcessId,
    pub current: ResourceLimits,
    pub target: ResourceLimits,
    pub reason: String,
    pub violations: u32,
}

impl PlannedChange {
    /// The shrinking part of the change: every dimension at min(current, target)
    pub fn shrink_step(&self) -> ResourceLimits {
        self.current.min(&self.target)
    }

    pub fn grows(&self) -> bool {
        ResourceKind::ALL
            .into_iter()
            .any(|kind| self.target.get(kind) > self.current.get(kind) + EPSILON)
    }

    pub fn shrinks(&self) -> bool {
        ResourceKind::ALL
            .into_iter()
            .any(|kind| self.target.get(kind) + EPSILON < self.current.get(kind))
    }
}

fn differs(a: &ResourceLimits, b: &ResourceLimits) -> bool {
    ResourceKind::ALL
        .into_iter()
        .any(|kind| (a.get(kind) - b.get(kind)).abs() > EPSILON)
}

/// Plan target limits for every allocation under `strategy`
///
/// `pending` counts workers waiting for admission; EQUAL reserves a share
/// for each of them. Only allocations whose limits would actually change
/// are returned.
pub fn plan(
    strategy: AllocationStrategy,
    allocations: &[&ResourceAllocation],
    capacity: &ResourceLimits,
    baseline: &ResourceLimits,
    pending: usize,
) -> Vec<PlannedChange> {
    if allocations.is_empty() {
        return Vec::new();
    }

    let targets: Vec<(usize, ResourceLimits, String)> = match strategy {
        AllocationStrategy::Equal => {
            let shares = allocations.len() + pending;
            let share = capacity.scale(1.0 / shares as f64);
            (0..allocations.len())
                .map(|i| (i, share, format!("equal share of {}", shares)))
                .collect()
        }
        AllocationStrategy::Priority => allocations
            .iter()
            .enumerate()
            .map(|(i, a)| {
                (
                    i,
                    baseline.scale(a.priority.multiplier()),
                    format!("priority {} x{}", a.priority, a.priority.multiplier()),
                )
            })
            .collect(),
        AllocationStrategy::FairShare => fair_share(allocations),
        AllocationStrategy::Adaptive => allocations
            .iter()
            .enumerate()
            .filter_map(|(i, a)| adaptive_target(a).map(|(t, reason)| (i, t, reason)))
            .collect(),
    };

    targets
        .into_iter()
        .filter_map(|(i, target, reason)| {
            let alloc = allocations[i];
            differs(&alloc.limits, &target).then(|| PlannedChange {
                process_id: alloc.process_id.clone(),
                current: alloc.limits,
                target,
                reason: format!("{}: {}", strategy.as_str(), reason),
                violations: alloc.violations,
            })
        })
        .collect()
}

fn fair_share(allocations: &[&ResourceAllocation]) -> Vec<(usize, ResourceLimits, String)> {
    let mut tiers: BTreeMap<Priority, Vec<usize>> = BTreeMap::new();
    for (i, alloc) in allocations.iter().enumerate() {
        tiers.entry(alloc.priority).or_default().push(i);
    }

    let mut out = Vec::with_capacity(allocations.len());
    for (priority, members) in tiers {
        let sum = members
            .iter()
            .fold(ResourceLimits::zero(), |acc, i| acc.plus(&allocations[*i].limits));
        let average = sum.scale(1.0 / members.len() as f64);
        for i in members {
            out.push((i, average, format!("{} tier average", priority)));
        }
    }
    out
}

/// Per-dimension shrink/grow from observed utilization
///
/// Allocations without usage samples are left alone.
fn adaptive_target(alloc: &ResourceAllocation) -> Option<(ResourceLimits, String)> {
    let utilization = alloc.utilization();
    if utilization.samples == 0 {
        return None;
    }

    let mut shrunk = Vec::new();
    let mut grown = Vec::new();
    let target = alloc.limits.map(|kind, current| {
        let used = utilization.get(kind);
        if used < ADAPTIVE_LOW_UTILIZATION {
            let floor = alloc.requested.get(kind) * ADAPTIVE_MIN_FRACTION;
            let next = (current * (1.0 - ADAPTIVE_STEP)).max(floor).min(current);
            if next + EPSILON < current {
                shrunk.push(kind.as_str());
            }
            next
        } else if used > ADAPTIVE_HIGH_UTILIZATION {
            grown.push(kind.as_str());
            let next = current * (1.0 + ADAPTIVE_STEP);
            // Whole units round up, or a limit of 1 could never grow
            if kind.is_integral() {
                (next - EPSILON).ceil()
            } else {
                next
            }
        } else {
            current
        }
    });

    let mut reason = Vec::new();
    if !shrunk.is_empty() {
        reason.push(format!("shrink {}", shrunk.join(",")));
    }
    if !grown.is_empty() {
        reason.push(format!("grow {}", grown.join(",")));
    }
    Some((target, reason.join("; ")))
}
