//! Bounded worker pool shared by every experiment the process reconciles

use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity admission gate for per-target operations.
///
/// Cloning shares the same slots. A slot is released when its permit drops,
/// whichever way the holding task exits.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot. Only fails once the pool has been closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.slots).acquire_owned().await
    }

    /// Stop admitting new work; callers waiting in [`WorkerPool::acquire`] fail.
    pub fn close(&self) {
        self.slots.close();
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.size - self.slots.available_permits()
    }
}
