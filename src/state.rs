//! Shared application state and service startup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use tracing::info;

use crate::archive::UnpackOptions;
use crate::config::Config;
use crate::error::SandboxError;
use crate::executor::BuildExecutor;
use crate::queue::JobQueue;
use crate::sandbox::SandboxPool;
use crate::worker::Worker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: JobQueue,
    /// Toolchain version and environment, captured at startup.
    pub info: Bytes,
    busy: Arc<AtomicUsize>,
}

impl AppState {
    /// Build the sandbox pool and queue, and spawn one worker per slot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config, info: impl Into<Bytes>) -> Result<Self, SandboxError> {
        let pool = SandboxPool::new(&config.sandbox_root, config.workers)?;
        let queue = JobQueue::bounded(config.queue_capacity);
        let executor = Arc::new(BuildExecutor::new(config.toolchain.clone()));
        let busy = Arc::new(AtomicUsize::new(0));
        let unpack = UnpackOptions {
            preserve_permissions: config.preserve_permissions,
        };

        info!(
            workers = pool.len(),
            root = %pool.root().display(),
            queue_capacity = queue.capacity(),
            "Starting build workers"
        );
        for slot in pool.into_slots() {
            let worker = Worker::new(slot, executor.clone(), queue.receiver(), unpack, busy.clone());
            tokio::spawn(worker.run());
        }

        Ok(Self {
            config: Arc::new(config),
            queue,
            info: info.into(),
            busy,
        })
    }

    /// Number of builds currently running.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }
}
