//! Per-service circuit breaker with a rolling error-rate window.
//!
//! A breaker trips from closed to open when, inside the rolling window, at least
//! `request_volume_threshold` calls were seen and the error percentage reached
//! `error_percent_threshold`. After `sleep_window` ms one caller is admitted as
//! the half-open trial; its outcome closes or re-opens the circuit. Every call is
//! also bounded by the command timeout and concurrency limit.

use crate::adaptive::DynamicConfig;
use crate::bulkhead::BulkheadPolicy;
use crate::clock::{Clock, MonotonicClock};
use crate::error::CallError;
use crate::timeout::TimeoutPolicy;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const WINDOW_BUCKETS: usize = 10;
const BUCKET_MILLIS: u64 = 1_000;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the sleep window elapses.
    Open,
    /// One trial call is testing recovery.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Lowercase name used by the metrics endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker parameters for one service, as stored under `gateway/hystrix/<service>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Per-call timeout in ms; `0` disables it.
    pub timeout: u64,
    /// Concurrent calls allowed; `0` means unlimited.
    pub max_concurrent_requests: u64,
    /// Minimum calls in the window before the error rate is considered.
    pub request_volume_threshold: u64,
    /// How long the circuit stays open before a trial, in ms.
    pub sleep_window: u64,
    /// Error percentage (0..=100) that trips the circuit.
    pub error_percent_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: 3_000,
            max_concurrent_requests: 100,
            request_volume_threshold: 20,
            sleep_window: 5_000,
            error_percent_threshold: 50,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerConfigError {
    /// Error percentage must be within 0..=100.
    InvalidErrorPercent {
        /// Value provided by caller.
        provided: u64,
    },
}

impl std::fmt::Display for BreakerConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerConfigError::InvalidErrorPercent { provided } => {
                write!(f, "error_percent_threshold must be within 0..=100 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for BreakerConfigError {}

impl BreakerConfig {
    /// Check value ranges. Unsigned fields already rule out negatives.
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.error_percent_threshold > 100 {
            return Err(BreakerConfigError::InvalidErrorPercent {
                provided: self.error_percent_threshold,
            });
        }
        Ok(())
    }
}

/// Live command settings derived from a [`BreakerConfig`].
#[derive(Debug)]
struct Command {
    config: BreakerConfig,
    timeout: TimeoutPolicy,
    bulkhead: BulkheadPolicy,
}

impl Command {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            timeout: TimeoutPolicy::from_millis(config.timeout),
            bulkhead: BulkheadPolicy::new(
                usize::try_from(config.max_concurrent_requests).unwrap_or(usize::MAX),
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    slot: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejected: u64,
    short_circuited: u64,
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Success,
    Failure,
    Timeout,
    Rejected,
    ShortCircuited,
}

/// Ten one-second buckets; slots older than the window are ignored on read.
#[derive(Debug, Default)]
struct RollingWindow {
    buckets: [Bucket; WINDOW_BUCKETS],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct WindowTotals {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejected: u64,
    short_circuited: u64,
}

impl WindowTotals {
    /// Calls that reached the backend (or timed out trying).
    fn requests(&self) -> u64 {
        self.successes + self.errors()
    }

    fn errors(&self) -> u64 {
        self.failures + self.timeouts
    }

    fn error_percent(&self) -> u64 {
        let total = self.requests();
        if total == 0 {
            0
        } else {
            self.errors() * 100 / total
        }
    }
}

impl RollingWindow {
    fn record(&mut self, now_millis: u64, event: Event) {
        let slot = now_millis / BUCKET_MILLIS;
        let bucket = &mut self.buckets[(slot % WINDOW_BUCKETS as u64) as usize];
        if bucket.slot != slot {
            *bucket = Bucket { slot, ..Bucket::default() };
        }
        match event {
            Event::Success => bucket.successes += 1,
            Event::Failure => bucket.failures += 1,
            Event::Timeout => bucket.timeouts += 1,
            Event::Rejected => bucket.rejected += 1,
            Event::ShortCircuited => bucket.short_circuited += 1,
        }
    }

    fn totals(&self, now_millis: u64) -> WindowTotals {
        let current = now_millis / BUCKET_MILLIS;
        self.buckets
            .iter()
            .filter(|b| current.saturating_sub(b.slot) < WINDOW_BUCKETS as u64 && b.slot <= current)
            .fold(WindowTotals::default(), |mut acc, b| {
                acc.successes += b.successes;
                acc.failures += b.failures;
                acc.timeouts += b.timeouts;
                acc.rejected += b.rejected;
                acc.short_circuited += b.short_circuited;
                acc
            })
    }

    fn reset(&mut self) {
        self.buckets = [Bucket::default(); WINDOW_BUCKETS];
    }
}

#[derive(Debug)]
pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    window: Mutex<RollingWindow>,
    latency: Mutex<Option<Histogram<u64>>>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_millis: AtomicU64::new(0),
            window: Mutex::new(RollingWindow::default()),
            latency: Mutex::new(Histogram::new_with_bounds(1, 60_000, 2).ok()),
        }
    }

    fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn window(&self) -> std::sync::MutexGuard<'_, RollingWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time counters for one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub status: CircuitState,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_percentage: u64,
    pub short_circuited: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub in_flight: usize,
    pub latency_p50_ms: u64,
    pub latency_p99_ms: u64,
    pub config: BreakerConfig,
}

/// Circuit breaker guarding calls to one named service.
///
/// Clones share state, so every handle observes and drives the same circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<CircuitBreakerState>,
    command: DynamicConfig<Command>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Validates `config`.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self::from_valid(name, config))
    }

    /// Build from a config the caller already validated.
    pub(crate) fn from_valid(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(CircuitBreakerState::new()),
            command: DynamicConfig::new(Command::new(config)),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Service this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters currently in force.
    pub fn config(&self) -> BreakerConfig {
        self.command.get().config
    }

    /// Install new parameters for future admissions.
    ///
    /// Calls already running keep the timeout and permit they started with.
    /// Returns `false` when `config` equals the current one and nothing changed.
    pub fn reconfigure(&self, config: BreakerConfig) -> Result<bool, BreakerConfigError> {
        config.validate()?;
        if self.command.get().config == config {
            return Ok(false);
        }
        self.command.set(Command::new(config));
        tracing::info!(
            target: "mulegate::circuit_breaker",
            service = %self.name,
            timeout_ms = config.timeout,
            max_concurrent = config.max_concurrent_requests,
            volume = config.request_volume_threshold,
            sleep_ms = config.sleep_window,
            error_percent = config.error_percent_threshold,
            "circuit breaker reconfigured"
        );
        Ok(true)
    }

    /// Current breaker state.
    ///
    /// An open circuit whose sleep window has passed still reports `Open` until a
    /// caller claims the trial.
    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    /// Runs `primary` under the breaker; on any failure the result of `fallback` is returned.
    ///
    /// `fallback` also runs, without `primary`, when the circuit rejects the call.
    pub async fn execute<T, E, Fut, Op, Fb>(&self, primary: Op, fallback: Fb) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        Fb: FnOnce(CallError<E>) -> T,
    {
        self.execute_classified(primary, |_| false, fallback).await
    }

    /// Like [`execute`](Self::execute), but an `Ok` value for which `is_failure`
    /// returns true is still handed back to the caller while being counted as a
    /// failure. The proxy uses this for 5xx responses.
    pub async fn execute_classified<T, E, Fut, Op, C, Fb>(
        &self,
        primary: Op,
        is_failure: C,
        fallback: Fb,
    ) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&T) -> bool,
        Fb: FnOnce(CallError<E>) -> T,
    {
        match self.call_classified(primary, is_failure).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }

    /// Core admission and accounting; returns the raw [`CallError`] instead of falling back.
    pub async fn call_classified<T, E, Fut, Op, C>(
        &self,
        primary: Op,
        is_failure: C,
    ) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&T) -> bool,
    {
        // Reverts an unfinished trial (caller cancelled or panicked) back to open.
        struct TrialGuard<'a> {
            state: &'a CircuitBreakerState,
            armed: bool,
        }
        impl Drop for TrialGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    let _ = self.state.state.compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }

        let mut guard = TrialGuard { state: &self.state, armed: false };

        loop {
            match self.state.current_state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed < self.command.get().config.sleep_window {
                        return Err(self.short_circuit(elapsed));
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(target: "mulegate::circuit_breaker", service = %self.name, "circuit breaker → half-open");
                            guard.armed = true;
                            break;
                        }
                        // Lost the race; re-read and either short-circuit or proceed closed.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    return Err(self.short_circuit(self.now_millis().saturating_sub(opened_at)));
                }
            }
        }

        let command = self.command.get();
        let started = Instant::now();
        let result = command
            .bulkhead
            .execute(|| {
                command.timeout.execute(|| async move { primary().await.map_err(CallError::Inner) })
            })
            .await;
        let took = started.elapsed();

        let event = match &result {
            Ok(value) if is_failure(value) => Event::Failure,
            Ok(_) => Event::Success,
            Err(CallError::Timeout { .. }) => Event::Timeout,
            Err(CallError::Rejected { .. }) => Event::Rejected,
            Err(_) => Event::Failure,
        };

        let trial = guard.armed;
        guard.armed = false;
        self.record(event, took, trial);
        result
    }

    /// Counters for the metrics endpoint.
    pub fn metrics(&self) -> BreakerMetrics {
        let totals = self.state.window().totals(self.now_millis());
        let (p50, p99) = self
            .state
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|h| !h.is_empty())
            .map(|h| (h.value_at_quantile(0.5), h.value_at_quantile(0.99)))
            .unwrap_or((0, 0));
        let command = self.command.get();
        BreakerMetrics {
            status: self.state(),
            total_requests: totals.requests(),
            error_count: totals.errors(),
            error_percentage: totals.error_percent(),
            short_circuited: totals.short_circuited,
            timeouts: totals.timeouts,
            rejected: totals.rejected,
            in_flight: command.bulkhead.in_flight(),
            latency_p50_ms: p50,
            latency_p99_ms: p99,
            config: command.config,
        }
    }

    fn short_circuit<E>(&self, elapsed_millis: u64) -> CallError<E> {
        self.state.window().record(self.now_millis(), Event::ShortCircuited);
        CallError::CircuitOpen {
            service: self.name.to_string(),
            open_for: Duration::from_millis(elapsed_millis),
        }
    }

    fn record(&self, event: Event, took: Duration, trial: bool) {
        let now = self.now_millis();
        if matches!(event, Event::Success | Event::Failure | Event::Timeout) {
            let mut latency = self.state.latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(h) = latency.as_mut() {
                h.saturating_record(u64::try_from(took.as_millis()).unwrap_or(u64::MAX));
            }
        }

        if trial {
            match event {
                Event::Success => self.close(),
                // A trial that never reached the backend still failed to prove recovery.
                _ => self.reopen(now, STATE_HALF_OPEN),
            }
            return;
        }

        let mut window = self.state.window();
        window.record(now, event);
        if !matches!(event, Event::Failure | Event::Timeout) {
            return;
        }
        let config = self.command.get().config;
        let totals = window.totals(now);
        drop(window);

        if totals.requests() >= config.request_volume_threshold
            && totals.error_percent() >= config.error_percent_threshold
            && self
                .state
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.state.opened_at_millis.store(now, Ordering::Release);
            tracing::error!(
                target: "mulegate::circuit_breaker",
                service = %self.name,
                requests = totals.requests(),
                errors = totals.errors(),
                error_percent = totals.error_percent(),
                "circuit breaker → open"
            );
        }
    }

    fn close(&self) {
        if self
            .state
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.window().reset();
            self.state.opened_at_millis.store(0, Ordering::Release);
            tracing::info!(target: "mulegate::circuit_breaker", service = %self.name, "circuit breaker → closed");
        }
    }

    fn reopen(&self, now: u64, from: u8) {
        if self
            .state
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.opened_at_millis.store(now, Ordering::Release);
            tracing::warn!(target: "mulegate::circuit_breaker", service = %self.name, "circuit breaker: trial failed → open");
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
