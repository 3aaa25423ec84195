//! Per-client admission control.
//!
//! Each client identity owns a token bucket ([`visitor`]) refilled by its own
//! lightweight task. [`RateLimiter::admit`] takes one token, waiting at most
//! the given timeout. A periodic sweep drops identities idle longer than the
//! configured window, and `max_visitors` caps how many are tracked at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use http::HeaderMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod visitor;

use visitor::Visitor;

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Tokens added per second per identity; `0` disables limiting.
    pub rate_per_sec: u32,
    /// Bucket capacity.
    pub burst: u32,
    /// Identities idle this long are dropped by the sweep.
    pub idle_timeout: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// Upper bound on tracked identities.
    pub max_visitors: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 100,
            burst: 100,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
            max_visitors: 100_000,
        }
    }
}

impl RateLimitConfig {
    pub fn per_second(rate: u32) -> Self {
        Self { rate_per_sec: rate, burst: rate, ..Self::default() }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Time between refills; never below one nanosecond for a non-zero rate.
    pub fn refill_interval(&self) -> Duration {
        if self.rate_per_sec == 0 {
            Duration::ZERO
        } else {
            (Duration::from_secs(1) / self.rate_per_sec).max(Duration::from_nanos(1))
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: RateLimitConfig,
    visitors: Mutex<HashMap<String, Arc<Visitor>>>,
    epoch: Instant,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn sweep(&self) -> usize {
        let now = self.now_ms();
        let mut map = self.visitors.lock().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, v| {
            let keep = v.idle_for(now) < self.config.idle_timeout;
            if !keep {
                v.retire();
            }
            keep
        });
        before - map.len()
    }
}

/// Token-bucket limiter keyed by client identity. Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_cancel(config, CancellationToken::new())
    }

    /// Limiter whose background tasks stop when `cancel` fires.
    pub fn with_cancel(config: RateLimitConfig, cancel: CancellationToken) -> Self {
        let config = RateLimitConfig { burst: config.burst.max(1), ..config };
        Self {
            inner: Arc::new(Inner {
                config,
                visitors: Mutex::new(HashMap::new()),
                epoch: Instant::now(),
                cancel: cancel.child_token(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.inner.config
    }

    /// Suggested client back-off after a rejection.
    pub fn retry_after(&self) -> Duration {
        self.inner.config.refill_interval().max(Duration::from_secs(1))
    }

    /// Number of identities currently tracked.
    pub fn visitor_count(&self) -> usize {
        self.inner.visitors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take one token for `identity`, waiting up to `timeout` for a refill.
    pub async fn admit(&self, identity: &str, timeout: Duration) -> bool {
        if self.inner.config.rate_per_sec == 0 {
            return true;
        }
        let Some(visitor) = self.visitor(identity) else {
            return false;
        };
        let admitted = visitor.take(timeout).await;
        if !admitted {
            debug!(target: "mulegate::rate_limit", identity, "rate limited");
        }
        admitted
    }

    fn visitor(&self, identity: &str) -> Option<Arc<Visitor>> {
        let inner = &self.inner;
        let now = inner.now_ms();
        {
            let map = inner.visitors.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(v) = map.get(identity) {
                v.touch(now);
                return Some(v.clone());
            }
        }

        if self.visitor_count() >= inner.config.max_visitors {
            let evicted = inner.sweep();
            debug!(target: "mulegate::rate_limit", evicted, "visitor table full; swept idle entries");
        }

        let mut map = inner.visitors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = map.get(identity) {
            v.touch(now);
            return Some(v.clone());
        }
        if map.len() >= inner.config.max_visitors {
            warn!(target: "mulegate::rate_limit", identity, max = inner.config.max_visitors, "visitor table full; request rejected");
            return None;
        }
        let visitor = Arc::new(Visitor::spawn(
            inner.config.burst as usize,
            inner.config.refill_interval(),
            now,
            &inner.cancel,
        ));
        map.insert(identity.to_string(), visitor.clone());
        Some(visitor)
    }

    /// Drop identities idle longer than the configured window; returns how many.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until cancelled or
    /// every limiter handle is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let evicted = inner.sweep();
                        if evicted > 0 {
                            info!(target: "mulegate::rate_limit", evicted, "idle visitors evicted");
                        }
                    }
                }
            }
        })
    }

    /// Stop every refill task and the sweeper.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

/// Rate-limit key for a request: `X-Real-IP`, else the first
/// `X-Forwarded-For` hop, else the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(ip) = header("x-real-ip") {
        return ip.to_string();
    }
    if let Some(first) = header("x-forwarded-for").and_then(|v| v.split(',').next()) {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    peer.map(|p| p.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}
