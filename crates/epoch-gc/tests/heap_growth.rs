//! Allocation budget and the policies built on it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use epoch_gc::{
    Boundary, Epoch, GcScheduler, GcState, HeapGrowthController, SchedulerConfig, SchedulerKind,
    Trigger,
};

fn config(target: u64) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_target_heap_bytes(target)
        .with_target_heap_utilization(0.5)
        .with_min_heap_bytes(0)
        .with_regular_gc_interval(Duration::from_secs(3600))
}

#[test]
fn test_target_tuned_from_live_set() {
    let growth = HeapGrowthController::new(config(1000));
    let remaining = growth.on_allocated(1000);
    assert_eq!(remaining, -100);

    growth.on_gc_done(200);
    assert_eq!(growth.config().target_heap_bytes, 400);
    // Budget replenished by the new weak target, 0.9 * 400.
    assert_eq!(growth.bytes_left(), -100 + 360);
    // Strong boundary is now 360 - 400.
    assert_eq!(growth.compute_boundary(-40), Boundary::Weak);
    assert_eq!(growth.compute_boundary(-41), Boundary::Strong);
}

#[test]
fn test_concurrent_allocations_are_all_charged() {
    let growth = Arc::new(HeapGrowthController::new(config(1000)));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let growth = Arc::clone(&growth);
            thread::spawn(move || {
                for _ in 0..1000 {
                    growth.on_allocated(10);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(growth.bytes_left(), 900 - 80_000);
}

#[test]
fn test_adaptive_weak_then_strong() {
    let state = Arc::new(GcState::new());
    let scheduler =
        GcScheduler::new(SchedulerKind::Adaptive, config(1000), Arc::clone(&state), 1).unwrap();
    let policy = scheduler.policy();

    assert_eq!(policy.on_allocation(800), Trigger::None);
    assert_eq!(policy.on_allocation(150), Trigger::Scheduled(Epoch(1)));
    assert_eq!(state.scheduled_epoch(), Epoch(1));
    // Past the target: same pending epoch, but the caller must wait.
    assert_eq!(policy.on_allocation(200), Trigger::WaitFinished(Epoch(1)));
    assert_eq!(policy.on_oom(64), Trigger::WaitFinished(Epoch(1)));
    policy.shutdown();
}

#[test]
fn test_aggressive_collects_every_n_safepoints() {
    let state = Arc::new(GcState::new());
    let scheduler =
        GcScheduler::new(SchedulerKind::Aggressive, SchedulerConfig::default(), Arc::clone(&state), 3)
            .unwrap();
    let policy = scheduler.policy();

    assert_eq!(policy.on_safe_point(), Trigger::None);
    assert_eq!(policy.on_safe_point(), Trigger::None);
    assert_eq!(policy.on_safe_point(), Trigger::WaitFinished(Epoch(1)));
    // Aggressive config: a 1 MiB target, so a 2 MiB allocation blows the budget.
    assert_eq!(policy.on_allocation(2 * 1024 * 1024), Trigger::WaitFinished(Epoch(1)));
}

#[test]
fn test_manual_ignores_budget() {
    let state = Arc::new(GcState::new());
    let scheduler =
        GcScheduler::new(SchedulerKind::Manual, config(1), Arc::clone(&state), 1).unwrap();
    assert_eq!(scheduler.policy().on_allocation(1 << 30), Trigger::None);
    assert!(scheduler.policy().heap_growth().is_none());
    assert_eq!(state.scheduled_epoch(), Epoch(0));
}
