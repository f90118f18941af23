/*!
 * Admission Property Tests
 * The sum of granted limits never exceeds capacity, whatever the operation order
 * or however malformed the requested limits are
 */

use bot_orchestrator::core::Priority;
use bot_orchestrator::resources::{
    AllocationStrategy, AllocatorConfig, ResourceAllocator, ResourceLimits, ResourceUsage,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate { slot: usize, priority: Priority, memory: Option<f64> },
    Deallocate { slot: usize },
    Update { slot: usize, cpu: f64, memory: f64 },
    Usage { slot: usize, cpu: f64, memory: f64 },
    Strategy(AllocationStrategy),
    Optimize,
    /// Allocate or update with a negative or non-finite dimension
    Malformed { slot: usize, update: bool, value: f64 },
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

fn strategy() -> impl Strategy<Value = AllocationStrategy> {
    prop_oneof![
        Just(AllocationStrategy::Equal),
        Just(AllocationStrategy::Priority),
        Just(AllocationStrategy::FairShare),
        Just(AllocationStrategy::Adaptive),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    let slot = 0usize..6;
    prop_oneof![
        3 => (slot.clone(), priority(), prop::option::of(16.0f64..2048.0))
            .prop_map(|(slot, priority, memory)| Op::Allocate { slot, priority, memory }),
        1 => slot.clone().prop_map(|slot| Op::Deallocate { slot }),
        2 => (slot.clone(), 1.0f64..300.0, 16.0f64..4096.0)
            .prop_map(|(slot, cpu, memory)| Op::Update { slot, cpu, memory }),
        3 => (slot, 0.0f64..200.0, 0.0f64..2048.0)
            .prop_map(|(slot, cpu, memory)| Op::Usage { slot, cpu, memory }),
        1 => strategy().prop_map(Op::Strategy),
        2 => Just(Op::Optimize),
        2 => (0usize..6, any::<bool>(), malformed_value())
            .prop_map(|(slot, update, value)| Op::Malformed { slot, update, value }),
    ]
}

fn malformed_value() -> impl Strategy<Value = f64> {
    prop_oneof![
        -100_000.0f64..-0.001,
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
    ]
}

fn apply(alloc: &ResourceAllocator, op: &Op) {
    let id = |slot: &usize| format!("w{}", slot);
    // Refusals are expected; only the invariant matters
    match op {
        Op::Allocate { slot, priority, memory } => {
            let request = memory.map(|mb| ResourceLimits::default().with_memory(mb));
            let _ = alloc.allocate(&id(slot), *priority, request);
        }
        Op::Deallocate { slot } => {
            let _ = alloc.deallocate(&id(slot));
        }
        Op::Update { slot, cpu, memory } => {
            let limits = ResourceLimits::default().with_cpu(*cpu).with_memory(*memory);
            let _ = alloc.update(&id(slot), limits);
        }
        Op::Usage { slot, cpu, memory } => {
            let usage = ResourceUsage {
                cpu_percent: *cpu,
                memory_mb: *memory,
                ..ResourceUsage::default()
            };
            let _ = alloc.record_usage(&id(slot), usage);
        }
        Op::Strategy(strategy) => alloc.set_strategy(*strategy),
        Op::Optimize => {
            alloc.optimize();
        }
        Op::Malformed { slot, update, value } => {
            let limits = ResourceLimits::default().with_memory(*value);
            let result = if *update {
                alloc.update(&id(slot), limits).map(|_| ())
            } else {
                alloc.allocate(&id(slot), Priority::Normal, Some(limits)).map(|_| ())
            };
            assert!(result.is_err(), "malformed limits accepted: {:?}", op);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_total_allocation_never_exceeds_capacity(
        ops in prop::collection::vec(op(), 1..60),
        memory_ceiling in 512.0f64..8192.0,
    ) {
        let capacity = ResourceLimits::system_default().with_memory(memory_ceiling);
        let alloc = ResourceAllocator::new(AllocatorConfig::default().with_capacity(capacity));

        for op in &ops {
            apply(&alloc, op);
            let total = alloc.total_allocated();
            prop_assert!(
                total.fits_within(&capacity),
                "after {:?}: {:?} exceeds {:?}",
                op,
                total,
                capacity
            );
            // Summed without clamping, so a negative grant cannot hide an excess
            let grants = alloc.allocations();
            prop_assert!(grants.iter().all(|a| a.limits.first_invalid().is_none()));
            let memory: f64 = grants.iter().map(|a| a.limits.memory_mb).sum();
            prop_assert!(memory <= capacity.memory_mb + 1e-6, "after {:?}: {} MB granted", op, memory);
        }
    }

    /// A rejected update leaves the previous grant in place
    #[test]
    fn prop_rejected_update_keeps_limits(memory in 600.0f64..4096.0) {
        let capacity = ResourceLimits::system_default().with_memory(512.0);
        let alloc = ResourceAllocator::new(AllocatorConfig::default().with_capacity(capacity));
        let granted = alloc
            .allocate("w1", Priority::Normal, Some(ResourceLimits::default().with_memory(256.0)))
            .unwrap()
            .limits;

        let applied = alloc
            .update("w1", ResourceLimits::default().with_memory(memory))
            .unwrap();
        prop_assert!(!applied);
        prop_assert_eq!(alloc.allocation("w1").unwrap().limits, granted);
        prop_assert!(!alloc.history(1)[0].success);
    }
}
