/*!
 * Resources Module
 * Per-worker budgets under a global ceiling, with pluggable rebalancing
 */

pub mod allocator;
pub mod strategy;
pub mod types;

// Re-export for convenience
pub use allocator::{AllocatorConfig, ResourceAllocator};
pub use strategy::{plan, PlannedChange};
pub use types::{
    AllocationStrategy, AllocatorStats, OptimizationReport, ReallocationRecord, ResourceAllocation,
    ResourceKind, ResourceLimits, ResourceUsage, ResourceUtilization,
};
