//! Collection: epoch state machine, marking and the pause protocol.

pub mod collector;
pub mod mark;
pub mod parallel;
pub mod state;
pub mod worklist;

pub use collector::MarkingBehavior;
pub use state::{Epoch, GcState};
