//! Live observation of suite executions.
//!
//! Channels serve full hierarchy snapshots rather than deltas, so an observer
//! can attach or reattach at any point.

mod events;
mod watcher;

pub use events::{CompleteData, ExecutionSummary, InitData, LogEvent, ProgressEvent};
pub use watcher::{ExecutionWatcher, LogObservation, StreamSettings};
