//! An epoch-scheduled mark-sweep garbage collector core.
//!
//! `epoch-gc` is the memory manager of a managed-language runtime. It
//! provides:
//!
//! - **A segregated paged heap**: small objects in per-size-class pages with
//!   free lists, medium objects in shared pages served by cursor, and large
//!   objects in pages of their own. Mutators cache one page per class and
//!   sweep lazily.
//! - **An epoch state machine**: collections are numbered; requests coalesce
//!   into the pending epoch and callers can wait for an epoch to finish or
//!   for its finalizers to run.
//! - **A stop-the-world pause** with cooperative suspension at safepoints.
//!   Suspended mutators may mark their own shadow stacks in parallel with the
//!   GC thread, balancing work by stealing.
//! - **Pluggable scheduling**: manual, adaptive (allocation budget plus a
//!   timer) and aggressive (stress) policies over a heap-growth budget.
//! - **Asynchronous finalization** on a background thread, one epoch at a
//!   time.
//!
//! # Quick Start
//!
//! ```no_run
//! use epoch_gc::{Runtime, RuntimeConfig, SchedulerKind, TypeInfo, CELL_SIZE};
//!
//! static NODE: TypeInfo = TypeInfo::object("Node", 2 * CELL_SIZE, 1);
//!
//! let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Adaptive))?;
//! let mut mutator = runtime.attach_mutator();
//!
//! let head = mutator.allocate_object(&NODE);
//! let slot = mutator.push_root(Some(head));
//! let next = mutator.allocate_object(&NODE);
//! head.store_ref(0, Some(next));
//!
//! mutator.schedule_and_wait_full_gc();
//! assert_eq!(mutator.root(slot), Some(head));
//! # Ok::<(), epoch_gc::GcError>(())
//! ```
//!
//! # Threads
//!
//! A [`Mutator`] is bound to the thread that attached it. Code that blocks
//! for a long time must run inside [`Mutator::enter_native`]; the collector
//! waits for every runnable mutator to reach a safepoint.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod config;
mod error;
mod extra;
pub mod finalizer;
pub mod gc;
pub mod metrics;
mod mutator;
pub mod object;
pub mod roots;
mod runtime;
pub mod scheduler;
mod thread;
pub mod tracing;

pub use alloc::{
    Heap, PageInfo, PageKind, PoolStats, ThreadAllocator, MEDIUM_PAGE_MAX_BLOCK_SIZE,
    MEDIUM_PAGE_SIZE, SMALL_PAGE_MAX_BLOCK_SIZE, SMALL_PAGE_SIZE,
};
pub use config::RuntimeConfig;
pub use error::GcError;
pub use extra::FinalizerQueue;
pub use finalizer::{FinalizerProcessor, FinalizerTasks};
pub use gc::mark::{MarkSession, MarkStats};
pub use gc::parallel::ParallelProcessor;
pub use gc::worklist::{StealQueue, WorkItem};
pub use gc::{Epoch, GcState, MarkingBehavior};
pub use metrics::{GcHistory, GcStats, GlobalMetrics};
pub use mutator::{Mutator, NativeGuard};
pub use object::{ObjRef, ObjectData, Tracer, TypeInfo, TypeKind, CELL_SIZE, HEADER_CELLS};
pub use roots::{GlobalRootId, GlobalRoots, ShadowStack};
pub use runtime::Runtime;
pub use scheduler::config::SchedulerConfig;
pub use scheduler::heap_growth::{Boundary, HeapGrowthController};
pub use scheduler::{GcScheduler, SchedulerKind, SchedulerPolicy, Trigger};
pub use thread::ThreadState;
