//! Bounded concurrency limiter for the uncached upload-pack path: at most
//! `count` `git upload-pack` children run at once.
//!
//! `tokio::sync::Semaphore` releases its permit from `Drop`, which is enough
//! on its own to guarantee release on every exit path (success, error,
//! cancellation) without the manual cancel-flag bookkeeping a callback-based
//! semaphore would need.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct UploadPackSemaphore {
    inner: Arc<Semaphore>,
}

impl UploadPackSemaphore {
    /// `count` is `min(MAX_GIT_UPLOAD_PACK, num_cpus)`, computed by
    /// [`crate::config::Config::from_env`].
    pub fn new(count: usize) -> Self {
        UploadPackSemaphore {
            inner: Arc::new(Semaphore::new(count.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Waits for a permit. Cancelling the returned future before it resolves
    /// simply drops the pending acquire; cancelling after acquisition (by
    /// dropping the permit) releases it immediately.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.inner
            .acquire()
            .await
            .expect("semaphore is never closed")
    }
}
