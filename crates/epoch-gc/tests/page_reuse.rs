//! Pages freed by a collection are reused before new pages are mapped.

use epoch_gc::{PageKind, Runtime, RuntimeConfig, SchedulerKind, TypeInfo, CELL_SIZE, HEADER_CELLS};

static SMALL: TypeInfo = TypeInfo::object("Small", CELL_SIZE, 0);
static LARGE: TypeInfo = TypeInfo::primitive_array("Blob", 1);

#[test]
fn test_small_pages_reused_after_collection() {
    const OBJECTS: usize = 10_000;
    let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual)).unwrap();
    let mut mutator = runtime.attach_mutator();
    let cells = HEADER_CELLS + 1;

    for _ in 0..OBJECTS {
        mutator.allocate_object(&SMALL);
    }
    let first = runtime.heap().small_pool_stats(cells);
    assert!(first.created > 0);

    mutator.schedule_and_wait_full_gc();
    assert_eq!(runtime.object_count(), 0);
    let swept = runtime.heap().small_pool_stats(cells);
    assert_eq!(swept.empty, first.created);

    for _ in 0..OBJECTS {
        mutator.allocate_object(&SMALL);
    }
    let second = runtime.heap().small_pool_stats(cells);
    assert_eq!(second.created, first.created);
    assert_eq!(second.destroyed, 0);
    assert_eq!(runtime.object_count(), OBJECTS);
}

#[test]
fn test_empty_pages_released_on_next_cycle() {
    let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual)).unwrap();
    let mut mutator = runtime.attach_mutator();
    for _ in 0..1000 {
        mutator.allocate_object(&SMALL);
    }
    mutator.schedule_and_wait_full_gc();
    let emptied = runtime.heap().pool_stats(PageKind::Small);
    assert!(emptied.empty > 0);

    mutator.schedule_and_wait_full_gc();
    let released = runtime.heap().pool_stats(PageKind::Small);
    assert_eq!(released.empty, 0);
    assert_eq!(released.live_pages(), 0);
    assert_eq!(released.destroyed, released.created);
}

#[test]
fn test_large_pages_unmapped_when_dead() {
    let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual)).unwrap();
    let mut mutator = runtime.attach_mutator();
    let blob = mutator.allocate_array(&LARGE, 1 << 20);
    assert_eq!(runtime.heap().page_info(blob).unwrap().kind, PageKind::Large);
    let committed = runtime.committed_bytes();
    assert!(committed >= 1 << 20);

    mutator.schedule_and_wait_full_gc();
    let stats = runtime.heap().pool_stats(PageKind::Large);
    assert_eq!((stats.created, stats.destroyed), (1, 1));
    assert!(runtime.committed_bytes() < committed);
}
