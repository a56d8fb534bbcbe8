//! Broadcasting for real-time event streaming.

pub mod batch_progress;

pub use batch_progress::{BatchEvent, BatchPhase, BatchProgressBroadcaster};
