//! Marking: gray queues, the tracer handed to type callbacks, and the
//! shared state of one mark phase.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::parallel::{ParallelProcessor, Worker};
use crate::object::{ObjRef, Tracer};

/// A gray worklist.
pub(crate) trait GrayQueue {
    fn push(&mut self, obj: ObjRef);
    fn pop(&mut self) -> Option<ObjRef>;
}

/// Serial gray worklist for one cycle.
#[derive(Debug, Default)]
pub struct MarkQueue {
    items: Vec<ObjRef>,
}

impl MarkQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl GrayQueue for MarkQueue {
    fn push(&mut self, obj: ObjRef) {
        self.items.push(obj);
    }

    fn pop(&mut self) -> Option<ObjRef> {
        self.items.pop()
    }
}

impl GrayQueue for Worker<ObjRef> {
    fn push(&mut self, obj: ObjRef) {
        Self::push(self, obj);
    }

    fn pop(&mut self) -> Option<ObjRef> {
        Self::pop(self)
    }
}

/// Totals across every marker of one phase.
#[derive(Debug, Default)]
pub struct MarkStats {
    objects: AtomicUsize,
    bytes: AtomicUsize,
    stack_roots: AtomicUsize,
    global_roots: AtomicUsize,
}

impl MarkStats {
    #[must_use]
    pub fn objects(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stack_roots(&self) -> usize {
        self.stack_roots.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn global_roots(&self) -> usize {
        self.global_roots.load(Ordering::Relaxed)
    }

    pub(crate) fn add_stack_roots(&self, count: usize) {
        self.stack_roots.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_global_roots(&self, count: usize) {
        self.global_roots.fetch_add(count, Ordering::Relaxed);
    }
}

/// Marks children and enqueues the ones it claims.
struct MarkTracer<'a, Q: GrayQueue> {
    queue: &'a mut Q,
    objects: usize,
    bytes: usize,
}

impl<Q: GrayQueue> MarkTracer<'_, Q> {
    fn claim(&mut self, obj: ObjRef) {
        if obj.gc_data().try_mark() {
            self.objects += 1;
            self.bytes += obj.allocated_size();
            self.queue.push(obj);
        }
    }
}

impl<Q: GrayQueue> Tracer for MarkTracer<'_, Q> {
    fn visit(&mut self, child: ObjRef) {
        self.claim(child);
    }
}

/// Marks `roots` and traces everything reachable from them.
pub(crate) fn mark<Q: GrayQueue>(
    queue: &mut Q,
    roots: impl IntoIterator<Item = ObjRef>,
    stats: &MarkStats,
) {
    let mut tracer = MarkTracer {
        queue,
        objects: 0,
        bytes: 0,
    };
    for root in roots {
        tracer.claim(root);
    }
    while let Some(obj) = tracer.queue.pop() {
        obj.trace_children(&mut tracer);
    }
    stats.objects.fetch_add(tracer.objects, Ordering::Relaxed);
    stats.bytes.fetch_add(tracer.bytes, Ordering::Relaxed);
}

/// A mark phase that mutators can join to mark their own stacks.
#[derive(Debug)]
pub struct MarkSession {
    processor: Arc<ParallelProcessor<ObjRef>>,
    stats: Arc<MarkStats>,
}

impl MarkSession {
    #[must_use]
    pub fn new(expected_workers: usize, stats: Arc<MarkStats>) -> Self {
        Self {
            processor: Arc::new(ParallelProcessor::new(expected_workers)),
            stats,
        }
    }

    /// Joins as a worker, marks from `roots` and helps until marking ends.
    ///
    /// Returns `false` if the session no longer accepts workers.
    pub(crate) fn participate(&self, roots: &[ObjRef]) -> bool {
        let Some(mut worker) = self.processor.register() else {
            return false;
        };
        mark(&mut worker, roots.iter().copied(), &self.stats);
        true
    }

    #[must_use]
    pub fn stats(&self) -> &MarkStats {
        &self.stats
    }

    #[must_use]
    pub fn processor(&self) -> &ParallelProcessor<ObjRef> {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Cell, TypeInfo, CELL_SIZE, HEADER_CELLS};
    use std::ptr::NonNull;

    static NODE: TypeInfo = TypeInfo::object("Node", 2 * CELL_SIZE, 2);

    struct Graph {
        _cells: Vec<Cell>,
        nodes: Vec<ObjRef>,
    }

    /// A binary tree laid out in heap order: node `i` links to `2i+1`, `2i+2`.
    fn tree(count: usize) -> Graph {
        let stride = HEADER_CELLS + 2;
        let cells: Vec<Cell> = (0..count * stride).map(|_| Cell::default()).collect();
        let nodes: Vec<ObjRef> = (0..count)
            .map(|i| unsafe { ObjRef::initialize(NonNull::from(&cells[i * stride]), &NODE, 0) })
            .collect();
        for (i, node) in nodes.iter().enumerate() {
            for slot in 0..2 {
                node.store_ref(slot, nodes.get(2 * i + 1 + slot).copied());
            }
        }
        Graph { _cells: cells, nodes }
    }

    #[test]
    fn test_serial_mark_reaches_subtree_only() {
        let g = tree(15);
        let stats = MarkStats::default();
        let mut queue = MarkQueue::new();
        mark(&mut queue, [g.nodes[1]], &stats);
        // Node 1 roots nodes 1, 3, 4, 7, 8, 9, 10.
        assert_eq!(stats.objects(), 7);
        assert_eq!(stats.bytes(), 7 * (HEADER_CELLS + 2) * CELL_SIZE);
        assert!(!g.nodes[0].gc_data().is_marked());
        assert!(!g.nodes[2].gc_data().is_marked());
        assert!(g.nodes[10].gc_data().is_marked());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_parallel_session_marks_each_object_once() {
        let g = tree(4095);
        let stats = Arc::new(MarkStats::default());
        let session = Arc::new(MarkSession::new(3, Arc::clone(&stats)));
        let nodes = Arc::new(g.nodes.clone());

        let helpers: Vec<_> = [1usize, 2]
            .into_iter()
            .map(|root| {
                let session = Arc::clone(&session);
                let nodes = Arc::clone(&nodes);
                std::thread::spawn(move || session.participate(&[nodes[root]]))
            })
            .collect();
        assert!(session.participate(&[g.nodes[0]]));
        for helper in helpers {
            assert!(helper.join().unwrap());
        }
        assert_eq!(stats.objects(), 4095);
        assert!(g.nodes.iter().all(|n| n.gc_data().is_marked()));
        assert!(session.processor().is_done());
    }
}
