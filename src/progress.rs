//! Progress events for a dormant-user scan.
//!
//! One unit of work is one (repository, activity type) pair.

use std::sync::Arc;

use crate::activity::ActivityType;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressEvent {
    /// Emitted once before any activity is fetched.
    Started { total: usize },

    /// One (repository, activity type) pair finished, successfully or not.
    Advanced {
        repository: String,
        activity: ActivityType,
        completed: usize,
        total: usize,
    },

    /// All pairs are done.
    Finished { completed: usize, skipped: usize },
}

/// Shared across the repository workers, hence `Arc` rather than `Box`.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}
