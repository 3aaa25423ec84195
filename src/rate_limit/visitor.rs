//! One rate-limited client and the task that refills its bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest period the refill task ticks at. Faster rates add several tokens per tick.
const MIN_REFILL_TICK: Duration = Duration::from_millis(1);

/// Token bucket for one identity. Tokens are semaphore permits; the refill
/// task adds one per interval while the bucket is below `burst`.
#[derive(Debug)]
pub(crate) struct Visitor {
    tokens: Arc<Semaphore>,
    /// Milliseconds since the limiter epoch of the latest admission attempt.
    last_seen: AtomicU64,
    refill: CancellationToken,
}

impl Visitor {
    /// Create a full bucket and start its refill task.
    pub(crate) fn spawn(
        burst: usize,
        interval: Duration,
        now_ms: u64,
        parent: &CancellationToken,
    ) -> Self {
        let tokens = Arc::new(Semaphore::new(burst));
        let refill = parent.child_token();
        tokio::spawn(refill_loop(tokens.clone(), burst, interval, refill.clone()));
        Self { tokens, last_seen: AtomicU64::new(now_ms), refill }
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_seen.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub(crate) fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_seen.load(Ordering::Acquire)))
    }

    pub(crate) fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Take one token, waiting at most `wait`.
    pub(crate) async fn take(&self, wait: Duration) -> bool {
        if let Ok(permit) = self.tokens.try_acquire() {
            permit.forget();
            return true;
        }
        if wait.is_zero() {
            return false;
        }
        match tokio::time::timeout(wait, self.tokens.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    /// Stop the refill task.
    pub(crate) fn retire(&self) {
        self.refill.cancel();
    }
}

async fn refill_loop(
    tokens: Arc<Semaphore>,
    burst: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(Duration::from_nanos(1));
    let tick = interval.max(MIN_REFILL_TICK);
    let per_tick = usize::try_from(tick.as_nanos() / interval.as_nanos()).unwrap_or(usize::MAX);
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let missing = burst.saturating_sub(tokens.available_permits());
                if missing > 0 {
                    tokens.add_permits(per_tick.clamp(1, missing));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn refills_one_token_per_interval_up_to_burst() {
        let root = CancellationToken::new();
        let v = Visitor::spawn(2, Duration::from_millis(100), 0, &root);
        assert!(v.take(Duration::ZERO).await);
        assert!(v.take(Duration::ZERO).await);
        assert!(!v.take(Duration::ZERO).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(v.available(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(v.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sub_millisecond_intervals_refill_in_batches() {
        let root = CancellationToken::new();
        let v = Visitor::spawn(5, Duration::from_nanos(1), 0, &root);
        for _ in 0..5 {
            assert!(v.take(Duration::ZERO).await);
        }
        assert_eq!(v.available(), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(v.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_visitor_stops_refilling() {
        let root = CancellationToken::new();
        let v = Visitor::spawn(1, Duration::from_millis(100), 0, &root);
        assert!(v.take(Duration::ZERO).await);
        v.retire();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(v.available(), 0);
    }

    #[test]
    fn idle_time_tracks_latest_touch() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let v = Visitor::spawn(1, Duration::from_secs(1), 1_000, &CancellationToken::new());
            v.touch(5_000);
            v.touch(3_000);
            assert_eq!(v.idle_for(6_000), Duration::from_millis(1_000));
        });
    }
}
