//! Dispatcher task and submission side of the queue.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::job::{JobHandle, JobId};

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedJob {
    id: JobId,
    label: String,
    work: BoxedJob,
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Submissions buffered before `submit` starts waiting for room.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Cheaply cloneable submission handle. The dispatcher stops once every
/// clone has been dropped and the backlog is drained.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl TaskQueue {
    /// Spawn the dispatcher on the current Tokio runtime.
    pub fn start(config: QueueConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedJob>(config.capacity.max(1));

        tokio::spawn(async move {
            info!(capacity = config.capacity, "task queue started");
            while let Some(job) = rx.recv().await {
                debug!(job_id = %job.id, label = %job.label, "starting job");
                let QueuedJob { id, label, work } = job;
                tokio::spawn(async move {
                    work.await;
                    debug!(job_id = %id, label = %label, "job finished");
                });
            }
            info!("task queue stopped");
        });

        Self { tx }
    }

    /// Enqueue `work`. Jobs are started in submission order and run
    /// concurrently once started.
    pub async fn submit<F, T>(
        &self,
        label: impl Into<String>,
        work: F,
    ) -> Result<JobHandle<T>, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = JobId::new();
        let (result_tx, result_rx) = oneshot::channel();
        let work: BoxedJob = Box::pin(async move {
            // The receiver may be gone; the job still runs to completion.
            let _ = result_tx.send(work.await);
        });

        self.tx
            .send(QueuedJob { id, label: label.into(), work })
            .await
            .map_err(|_| QueueError::Closed)?;

        Ok(JobHandle::new(id, result_rx))
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================
