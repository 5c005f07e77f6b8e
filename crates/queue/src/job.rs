//! Job identity and result handles.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result side of a submitted job.
///
/// Dropping the handle does not cancel the job.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: JobId,
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(id: JobId, rx: oneshot::Receiver<T>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to finish and return its output.
    pub async fn join(self) -> Result<T, QueueError> {
        self.rx.await.map_err(|_| QueueError::Lost(self.id))
    }
}
