//! Crash-resumable OS rebuilds
//!
//! The marker files are a small persisted state machine with their own
//! load/save routines; the orchestrator drives them through a rebuild.

mod markers;
mod orchestrator;

pub use markers::{InProgressMarker, RebuildMarkers};
pub use orchestrator::RebuildOrchestrator;
