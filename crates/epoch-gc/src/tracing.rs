//! Structured tracing for collection cycles.
//!
//! Every cycle runs inside a `gc_collect` span carrying its epoch, and each
//! pause step inside a nested `gc_phase` span.

use tracing::{span, Level};

use crate::gc::state::Epoch;

/// Steps of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Waiting for mutators to reach a safepoint.
    Suspend,
    /// Collecting global and thread roots.
    RootSet,
    /// Tracing the live object graph.
    Mark,
    /// Sweeping side records and queueing finalizers.
    SweepExtra,
    /// Reclaiming dead blocks.
    Sweep,
    /// Running finalizers on the finalizer thread.
    Finalize,
}

/// Creates a span for a whole collection.
pub fn trace_gc_collection(epoch: Epoch) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_collect", epoch = epoch.0).entered()
}

/// Creates a span for one phase.
pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
}

/// Logs the start of a phase.
pub fn log_phase_start(phase: GcPhase, heap_bytes: usize) {
    tracing::debug!(phase = ?phase, heap_bytes, "phase_start");
}

/// Logs the end of a phase.
pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
    tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
}
