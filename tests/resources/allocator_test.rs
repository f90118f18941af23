/*!
 * Resource Allocator Tests
 * Reduced grants, strategies and usage feedback through the public API
 */

use bot_orchestrator::core::Priority;
use bot_orchestrator::resources::{
    AllocationStrategy, AllocatorConfig, ResourceAllocator, ResourceLimits, ResourceUsage,
};
use bot_orchestrator::ResourceError;
use pretty_assertions::assert_eq;

fn allocator(memory_ceiling: f64, strategy: AllocationStrategy) -> ResourceAllocator {
    ResourceAllocator::new(
        AllocatorConfig::default()
            .with_capacity(ResourceLimits::system_default().with_memory(memory_ceiling))
            .with_strategy(strategy),
    )
}

fn memory(mb: f64) -> Option<ResourceLimits> {
    Some(ResourceLimits::default().with_memory(mb))
}

#[test]
fn test_reduced_grant_still_checked_against_ceiling() {
    let alloc = allocator(512.0, AllocationStrategy::Priority);
    alloc.allocate("w1", Priority::Normal, memory(400.0)).unwrap();

    // 70% of 400 is 280; 400 + 280 is still above 512
    let err = alloc.allocate("w2", Priority::Normal, memory(400.0)).unwrap_err();
    match err {
        ResourceError::Infeasible { process_id, reason } => {
            assert_eq!(process_id, "w2");
            assert!(reason.contains("memory_mb"), "{}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!alloc.has_allocation("w2"));
    assert_eq!(alloc.stats().rejected, 1);
    assert!((alloc.total_allocated().memory_mb - 400.0).abs() < 1e-9);
}

#[test]
fn test_equal_strategy_splits_on_optimize() {
    let alloc = allocator(1000.0, AllocationStrategy::Equal);
    alloc.allocate("a", Priority::Normal, memory(100.0)).unwrap();
    alloc.allocate("b", Priority::Critical, memory(100.0)).unwrap();

    let report = alloc.optimize();
    assert_eq!(report.strategy, Some(AllocationStrategy::Equal));
    assert_eq!(report.applied, 2);
    for allocation in alloc.allocations() {
        assert!((allocation.limits.memory_mb - 500.0).abs() < 1e-9);
    }
    assert!(alloc.total_allocated().fits_within(&alloc.capacity()));
}

#[test]
fn test_equal_split_leaves_room_for_newcomer() {
    let alloc = allocator(1000.0, AllocationStrategy::Equal);
    alloc.allocate("a", Priority::Normal, memory(100.0)).unwrap();
    alloc.allocate("b", Priority::Normal, memory(100.0)).unwrap();
    alloc.optimize();
    assert!(alloc.available().memory_mb.abs() < 1e-6);

    let c = alloc.allocate("c", Priority::Normal, memory(100.0)).unwrap();
    assert!((c.limits.memory_mb - 100.0).abs() < 1e-9);
    for id in ["a", "b"] {
        let share = alloc.allocation(id).unwrap().limits.memory_mb;
        assert!((share - 1000.0 / 3.0).abs() < 1e-6, "{} holds {}", id, share);
    }
    assert_eq!(alloc.stats().reduced_grants, 0);
    assert!(alloc.total_allocated().fits_within(&alloc.capacity()));
}

#[test]
fn test_malformed_limits_are_refused() {
    let alloc = allocator(512.0, AllocationStrategy::Adaptive);

    let err = alloc.allocate("neg", Priority::Normal, memory(-4096.0)).unwrap_err();
    assert!(matches!(err, ResourceError::InvalidLimits { ref process_id, .. } if process_id == "neg"));
    assert!(alloc.allocate("nan", Priority::Normal, memory(f64::NAN)).is_err());
    assert_eq!(alloc.stats().allocations, 0);

    // The ceiling is untouched, so an oversized request is still refused
    assert!(alloc.allocate("big", Priority::Normal, memory(4000.0)).is_err());

    alloc.allocate("ok", Priority::Normal, memory(256.0)).unwrap();
    assert!(matches!(
        alloc.update("ok", ResourceLimits::default().with_memory(f64::INFINITY)),
        Err(ResourceError::InvalidLimits { .. })
    ));
    assert!((alloc.allocation("ok").unwrap().limits.memory_mb - 256.0).abs() < 1e-9);
}

#[test]
fn test_strategy_switch_takes_effect_on_next_pass() {
    let alloc = allocator(8192.0, AllocationStrategy::Adaptive);
    alloc.allocate("a", Priority::Critical, None).unwrap();
    let before = alloc.allocation("a").unwrap().limits;

    // No samples yet: adaptive leaves the grant alone
    assert_eq!(alloc.optimize().applied, 0);

    alloc.set_strategy(AllocationStrategy::Priority);
    alloc.optimize();
    let after = alloc.allocation("a").unwrap().limits;
    assert_eq!(before, after);
    assert_eq!(alloc.strategy(), AllocationStrategy::Priority);
}

#[test]
fn test_usage_feedback_counts_violations() {
    let alloc = allocator(8192.0, AllocationStrategy::Adaptive);
    alloc.allocate("a", Priority::Normal, None).unwrap();

    let over = ResourceUsage {
        cpu_percent: 90.0,
        memory_mb: 100.0,
        ..ResourceUsage::default()
    };
    assert_eq!(alloc.record_usage("a", over).unwrap(), 1);
    assert_eq!(alloc.record_usage("a", over).unwrap(), 1);
    assert_eq!(alloc.allocation("a").unwrap().violations, 2);

    let utilization = alloc.utilization("a").unwrap();
    assert_eq!(utilization.samples, 2);
    assert!(utilization.cpu > 1.0);

    assert!(matches!(
        alloc.record_usage("ghost", over),
        Err(ResourceError::NotAllocated(_))
    ));
}

#[test]
fn test_history_is_newest_last_and_limited() {
    let alloc = allocator(8192.0, AllocationStrategy::Adaptive);
    alloc.allocate("a", Priority::Normal, None).unwrap();
    for mb in [300.0, 320.0, 340.0] {
        assert!(alloc.update_with_reason("a", ResourceLimits::default().with_memory(mb), "manual").unwrap());
    }

    let history = alloc.history(2);
    assert_eq!(history.len(), 2);
    assert!((history[1].after.memory_mb - 340.0).abs() < 1e-9);
    assert_eq!(history[1].reason, "manual");
}
