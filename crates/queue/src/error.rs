//! Queue-level error types.

use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The dispatcher has shut down and accepts no more work.
    #[error("task queue is closed")]
    Closed,

    /// The job ended without producing a result (it panicked or was aborted).
    #[error("job {0} ended without a result")]
    Lost(JobId),
}
