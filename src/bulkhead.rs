//! Concurrency limit for a breaker command.

use crate::error::CallError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Rejects calls beyond `max_concurrent` instead of queueing them.
#[derive(Debug, Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BulkheadPolicy {
    /// `0` means unlimited. Values above [`Semaphore::MAX_PERMITS`] are capped to it.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = if max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            max_concurrent.min(Semaphore::MAX_PERMITS)
        };
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    /// Configured ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, CallError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let in_flight = self.in_flight();

        let permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| CallError::Rejected { in_flight, max: self.max_concurrent })?;

        let result = operation().await;
        drop(permit);
        result
    }
}
