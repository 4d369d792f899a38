use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

use crate::{AppError, AppResult};

/// Bounded executor for request handling.
///
/// At most `capacity` submitted tasks run at once. [`WorkerPool::submit`]
/// waits for a free slot, so a saturated pool pushes back on whoever is
/// feeding it.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(AppError::InvalidValue(
                "worker pool capacity must be at least 1".into(),
            ));
        }
        Ok(WorkerPool {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs `task` once a slot frees up. Returns when the task has started,
    /// not when it finishes.
    pub async fn submit<F>(&self, task: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::IllegalStateError(format!("worker pool closed: {}", e)))?;
        trace!("worker slot taken, {} left", self.slots.available_permits());

        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    /// Stops handing out slots; later submits fail.
    pub fn close(&self) {
        self.slots.close();
    }
}
