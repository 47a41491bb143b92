//! Bounded hand-off between request handlers and workers.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::ApiError;
use crate::job::Job;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is full")]
    Full(Job),
    #[error("job queue is closed")]
    Closed(Job),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full(_) => ApiError::Busy,
            QueueError::Closed(_) => ApiError::WorkerGone,
        }
    }
}

/// FIFO queue of jobs waiting for a worker.
///
/// Jobs already picked up by a worker do not count against the capacity.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    rx: JobReceiver,
    capacity: usize,
}

impl JobQueue {
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: JobReceiver(Arc::new(Mutex::new(rx))),
            capacity,
        }
    }

    /// Enqueue without waiting. A full queue hands the job back.
    pub fn submit(&self, job: Job) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => QueueError::Full(job),
            mpsc::error::TrySendError::Closed(job) => QueueError::Closed(job),
        })
    }

    /// A handle for workers to pull jobs from.
    pub fn receiver(&self) -> JobReceiver {
        self.rx.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs currently waiting.
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

/// Shared consumer end of a [`JobQueue`].
#[derive(Clone)]
pub struct JobReceiver(Arc<Mutex<mpsc::Receiver<Job>>>);

impl JobReceiver {
    /// Wait for the next job. `None` once every sender is gone.
    pub async fn next(&self) -> Option<Job> {
        self.0.lock().await.recv().await
    }
}
