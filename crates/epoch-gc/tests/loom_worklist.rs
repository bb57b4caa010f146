//! Loom tests for the work-stealing queue used by parallel marking.
//!
//! These exercise the owner/thief races on a tiny queue so that every slot
//! wraps around.

use std::sync::Arc;

use epoch_gc::StealQueue;

const QUEUE_SIZE: usize = 4;

/// A steal racing a push sees either nothing or the pushed item.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist_push --release"]
fn test_push_then_steal_sees_data() {
    loom::model(|| {
        let queue: Arc<StealQueue<usize, QUEUE_SIZE>> = Arc::new(StealQueue::new());

        let owner = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.push(42)
        });
        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });

        let pushed = owner.join().unwrap();
        let stolen = thief.join().unwrap();
        assert!(pushed);
        assert!(stolen.is_none() || stolen == Some(42));
    });
}

/// The owner and a thief racing for the last item never both win.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist_last_item --release"]
fn test_pop_steal_last_item_claimed_once() {
    loom::model(|| {
        let queue: Arc<StealQueue<usize, QUEUE_SIZE>> = Arc::new(StealQueue::new());
        assert!(queue.push(7));

        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });
        let popped = queue.pop();
        let stolen = thief.join().unwrap();

        let claimed = usize::from(popped.is_some()) + usize::from(stolen.is_some());
        assert_eq!(claimed, 1);
        assert!(queue.is_empty());
    });
}

/// Items pushed while a thief drains are each seen exactly once.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist_concurrent --release"]
fn test_concurrent_push_steal_no_duplicates() {
    loom::model(|| {
        let queue: Arc<StealQueue<usize, QUEUE_SIZE>> = Arc::new(StealQueue::new());

        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    if let Some(item) = queue.steal() {
                        seen.push(item);
                    }
                }
                seen
            }
        });

        let mut seen = Vec::new();
        for item in 0..3 {
            assert!(queue.push(item));
        }
        while let Some(item) = queue.pop() {
            seen.push(item);
        }
        seen.extend(thief.join().unwrap());
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    });
}

/// A full queue rejects the push instead of overwriting a slot.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist_full --release"]
fn test_full_queue_rejects_push() {
    loom::model(|| {
        let queue: Arc<StealQueue<usize, QUEUE_SIZE>> = Arc::new(StealQueue::new());
        for item in 0..QUEUE_SIZE {
            assert!(queue.push(item));
        }

        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });
        let pushed = queue.push(99);
        let stolen = thief.join().unwrap();

        assert_eq!(stolen, Some(0));
        let mut rest = Vec::new();
        while let Some(item) = queue.pop() {
            rest.push(item);
        }
        if pushed {
            assert_eq!(rest, vec![99, 3, 2, 1]);
        } else {
            assert_eq!(rest, vec![3, 2, 1]);
        }
    });
}
