//! Mutators marking their own stacks alongside the GC thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use epoch_gc::{MarkingBehavior, Mutator, ObjRef, Runtime, RuntimeConfig, SchedulerKind, TypeInfo, CELL_SIZE};

static LEAF: TypeInfo = TypeInfo::object("Leaf", CELL_SIZE, 0);
static NODE: TypeInfo = TypeInfo::object("Node", CELL_SIZE, 1);
static REFS: TypeInfo = TypeInfo::reference_array("Array");

const THREADS: usize = 4;
const FAN_OUT: usize = 2_000;
const PER_THREAD: usize = 1 + 2 * FAN_OUT;

/// A wide array of node -> leaf pairs, rooted by its array only.
fn build(mutator: &mut Mutator) -> ObjRef {
    let array = mutator.allocate_array(&REFS, FAN_OUT);
    mutator.push_root(Some(array));
    for i in 0..FAN_OUT {
        let node = mutator.allocate_object(&NODE);
        array.store_ref(i, Some(node));
        let leaf = mutator.allocate_object(&LEAF);
        leaf.store_word(0, i);
        node.store_ref(0, Some(leaf));
    }
    array
}

fn verify(array: ObjRef) {
    for i in 0..FAN_OUT {
        let node = array.load_ref(i).unwrap();
        let leaf = node.load_ref(0).unwrap();
        assert_eq!(leaf.load_word(0), i);
    }
}

fn run(marking: MarkingBehavior) {
    let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual).with_marking(marking)).unwrap();
    let barrier = Barrier::new(THREADS);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for id in 0..THREADS {
            let (runtime, barrier, done) = (&runtime, &barrier, &done);
            s.spawn(move || {
                let mut mutator = runtime.attach_mutator();
                let array = build(&mut mutator);
                barrier.wait();
                if id == 0 {
                    mutator.schedule_and_wait_full_gc();
                    done.store(true, Ordering::SeqCst);
                } else {
                    while !done.load(Ordering::SeqCst) {
                        mutator.safepoint_loop_body();
                    }
                }
                verify(array);
            });
        }
    });

    let stats = runtime.history().last().unwrap();
    assert_eq!(stats.stack_roots, THREADS);
    assert_eq!(stats.marked_objects, THREADS * PER_THREAD);
    assert_eq!(stats.swept_objects, 0);
    assert_eq!(runtime.object_count(), THREADS * PER_THREAD);
}

#[test]
fn test_self_marking_mutators() {
    run(MarkingBehavior::MarkOwnStack);
}

#[test]
fn test_collector_scans_every_stack() {
    run(MarkingBehavior::DoNotMark);
}
