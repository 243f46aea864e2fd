//! Shared pool for CPU-bound work (Opus encode/decode, VAD inference).
//!
//! Work runs on tokio's blocking threads; a semaphore caps how many jobs
//! run at once so codec work from many sessions cannot starve the runtime.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Error returned when a pooled job could not run to completion.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("Worker pool is closed")]
    Closed,
    #[error("Worker job panicked: {0}")]
    Panicked(String),
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Pool sized `min(8, 2 × available CPUs)`.
    pub fn with_default_size() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new((cpus * 2).min(8))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a permit is available.
    pub async fn run<F, R>(&self, job: F) -> Result<R, WorkerPoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerPoolError::Closed)?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });
        handle
            .await
            .map_err(|e| WorkerPoolError::Panicked(e.to_string()))
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::with_default_size()
    }
}
