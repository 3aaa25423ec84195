//! Per-call timeout used by breaker commands.

use crate::error::CallError;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Option<Duration>,
}

impl TimeoutPolicy {
    /// Timeout after `millis`; `0` means the call is never cut short.
    pub fn from_millis(millis: u64) -> Self {
        let duration = (millis > 0).then(|| Duration::from_millis(millis));
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Run `operation`, failing with [`CallError::Timeout`] once the limit passes.
    /// The operation future is dropped on timeout, which aborts in-flight I/O.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, CallError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let Some(limit) = self.duration else {
            return operation().await;
        };
        let start = Instant::now();

        match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout { elapsed: start.elapsed(), timeout: limit }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::from_millis(100);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = timeout
            .execute(|| async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, CallError<TestError>>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation() {
        let timeout = TimeoutPolicy::from_millis(50);

        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, CallError<TestError>>(42)
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_means_unbounded() {
        let timeout = TimeoutPolicy::from_millis(0);
        assert_eq!(timeout.duration(), None);
        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, CallError<TestError>>(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
