//! Triggers that block the mutator return only after the cycle finished.

use std::time::Duration;

use epoch_gc::{Epoch, PageKind, Runtime, RuntimeConfig, SchedulerConfig, SchedulerKind, TypeInfo};

static BYTES: TypeInfo = TypeInfo::primitive_array("ByteArray", 1);

#[test]
fn test_strong_boundary_allocation_waits_for_finished() {
    let config = SchedulerConfig::default()
        .with_auto_tune(false)
        .with_min_heap_bytes(0)
        .with_target_heap_bytes(64 * 1024)
        .with_regular_gc_interval(Duration::from_secs(3600));
    let runtime = Runtime::new(
        RuntimeConfig::new(SchedulerKind::Adaptive).with_scheduler_config(config),
    )
    .unwrap();
    let mut mutator = runtime.attach_mutator();
    assert_eq!(runtime.state().finished_epoch(), Epoch(0));

    // One request overshoots the target by more than the weak margin.
    let blob = mutator.allocate_array(&BYTES, 80_000);
    assert!(runtime.state().finished_epoch() >= Epoch(1));
    assert!(runtime.metrics().total_collections() >= 1);

    // The blob is allocated after the wait, so the cycle never saw it.
    assert_eq!(runtime.object_count(), 1);
    assert_eq!(runtime.heap().page_info(blob).map(|p| p.kind), Some(PageKind::Medium));
}

#[test]
fn test_aggressive_safepoint_waits_for_finished() {
    let runtime = Runtime::new(
        RuntimeConfig::new(SchedulerKind::Aggressive).with_aggressive_safepoint_interval(3),
    )
    .unwrap();
    let mut mutator = runtime.attach_mutator();

    mutator.safepoint();
    mutator.safepoint();
    assert_eq!(runtime.state().finished_epoch(), Epoch(0));

    mutator.safepoint();
    assert_eq!(runtime.state().finished_epoch(), Epoch(1));
    assert_eq!(runtime.metrics().total_collections(), 1);
}
