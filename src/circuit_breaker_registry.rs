//! Registry of named circuit breakers, one per backend service.
//!
//! Breakers are created lazily with the default parameters the first time a
//! service is called, and reconfigured in place when stored parameters change,
//! so a reload never resets live circuit state.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{PoisonError, RwLock};

use crate::circuit_breaker::{
    BreakerConfig, BreakerConfigError, BreakerMetrics, CircuitBreaker, CircuitState,
};
use crate::clock::Clock;
use crate::error::CallError;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Entry {
    breaker: CircuitBreaker,
    /// Parameters came from the config store or an admin call rather than defaults.
    explicit: bool,
}

/// In-memory breaker registry shared by the dispatcher, reloader and admin API.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    inner: RwLock<HashMap<String, Entry>>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Registry whose unconfigured services use `defaults`.
    ///
    /// Invalid defaults are replaced by [`BreakerConfig::default`] with a warning.
    pub fn new(defaults: BreakerConfig) -> Self {
        let defaults = match defaults.validate() {
            Ok(()) => defaults,
            Err(e) => {
                warn!(target: "mulegate::circuit_breaker_registry", error = %e, "invalid default breaker config; using built-in defaults");
                BreakerConfig::default()
            }
        };
        Self { defaults, inner: RwLock::new(HashMap::new()), clock: None }
    }

    /// Drive every breaker from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Parameters used for services with nothing stored.
    pub fn defaults(&self) -> BreakerConfig {
        self.defaults
    }

    /// Install or update parameters for `service`.
    ///
    /// Returns `Ok(false)` when the breaker already runs with exactly this config.
    pub fn configure(&self, service: &str, config: BreakerConfig) -> Result<bool, BreakerConfigError> {
        config.validate()?;
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(service) {
            Some(entry) => {
                entry.explicit = true;
                entry.breaker.reconfigure(config)
            }
            None => {
                let breaker = self.build(service, config);
                map.insert(service.to_string(), Entry { breaker, explicit: true });
                info!(target: "mulegate::circuit_breaker_registry", service = %service, "circuit breaker registered");
                Ok(true)
            }
        }
    }

    /// Drop stored parameters for `service`; its breaker falls back to the defaults.
    pub fn unconfigure(&self, service: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(service) {
            Some(entry) if entry.explicit => {
                entry.explicit = false;
                // Defaults were validated in `new`.
                let _ = entry.breaker.reconfigure(self.defaults);
                true
            }
            _ => false,
        }
    }

    /// Make the explicit configuration equal `configs`: apply every entry, and
    /// revert services missing from `configs` to defaults. Invalid entries are
    /// skipped with a warning.
    pub fn sync(&self, configs: &HashMap<String, BreakerConfig>) {
        for (service, config) in configs {
            if let Err(e) = self.configure(service, *config) {
                warn!(target: "mulegate::circuit_breaker_registry", service = %service, error = %e, "invalid breaker config skipped");
            }
        }
        let stale: Vec<String> = {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            map.iter()
                .filter(|(name, e)| e.explicit && !configs.contains_key(name.as_str()))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for service in stale {
            self.unconfigure(&service);
        }
    }

    /// Breaker for `service`, created with defaults on first use.
    pub fn breaker(&self, service: &str) -> CircuitBreaker {
        if let Some(entry) = self.inner.read().unwrap_or_else(PoisonError::into_inner).get(service) {
            return entry.breaker.clone();
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(service.to_string())
            .or_insert_with(|| Entry {
                breaker: self.build(service, self.defaults),
                explicit: false,
            })
            .breaker
            .clone()
    }

    /// Run `primary` under the breaker named `service`; see [`CircuitBreaker::execute`].
    pub async fn execute<T, E, Fut, Op, Fb>(&self, service: &str, primary: Op, fallback: Fb) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        Fb: FnOnce(CallError<E>) -> T,
    {
        self.breaker(service).execute(primary, fallback).await
    }

    /// State of the breaker for `service`, if one exists.
    pub fn status(&self, service: &str) -> Option<CircuitState> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|e| e.breaker.state())
    }

    /// Metrics for one breaker.
    pub fn metrics(&self, service: &str) -> Option<BreakerMetrics> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|e| e.breaker.metrics())
    }

    /// Metrics for every breaker, sorted by service.
    pub fn snapshot(&self) -> BTreeMap<String, BreakerMetrics> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|(k, v)| (k.clone(), v.breaker.metrics())).collect()
    }

    /// Explicitly stored parameters, sorted by service.
    pub fn configured(&self) -> BTreeMap<String, BreakerConfig> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .filter(|(_, e)| e.explicit)
            .map(|(k, e)| (k.clone(), e.breaker.config()))
            .collect()
    }

    fn build(&self, service: &str, config: BreakerConfig) -> CircuitBreaker {
        let breaker = CircuitBreaker::from_valid(service, config);
        match &self.clock {
            Some(clock) => breaker.with_clock(SharedClock(clock.clone())),
            None => breaker,
        }
    }
}

#[derive(Debug)]
struct SharedClock(Arc<dyn Clock>);

impl Clock for SharedClock {
    fn now_millis(&self) -> u64 {
        self.0.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn tight() -> BreakerConfig {
        BreakerConfig { request_volume_threshold: 1, sleep_window: 1_000, ..BreakerConfig::default() }
    }

    #[tokio::test]
    async fn execute_uses_fallback_when_open() {
        let registry = CircuitBreakerRegistry::default().with_clock(ManualClock::new());
        registry.configure("basic", tight()).unwrap();

        let first = registry
            .execute("basic", || async { Err::<String, _>("refused") }, |e| format!("fallback: {e}"))
            .await;
        assert_eq!(first, "fallback: refused");
        assert_eq!(registry.status("basic"), Some(CircuitState::Open));

        let second = registry
            .execute(
                "basic",
                || async { Ok::<_, &str>("never".to_string()) },
                |e| format!("fallback: {e}"),
            )
            .await;
        assert!(second.contains("circuit open for 'basic'"), "got {second}");
    }

    #[test]
    fn configure_twice_is_a_no_op() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.configure("svc", tight()).unwrap());
        let before = registry.metrics("svc");
        assert!(!registry.configure("svc", tight()).unwrap());
        assert_eq!(registry.metrics("svc"), before);
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_accepted() {
        let registry = CircuitBreakerRegistry::default();
        let config = BreakerConfig { max_concurrent_requests: u64::MAX, ..BreakerConfig::default() };
        assert!(config.validate().is_ok());
        assert!(registry.configure("svc", config).unwrap());
        let out = registry.execute("svc", || async { Ok::<_, &str>("served") }, |_| "fallback").await;
        assert_eq!(out, "served");
        assert_eq!(registry.metrics("svc").unwrap().in_flight, 0);
    }

    #[test]
    fn breakers_are_created_lazily_with_defaults() {
        let registry = CircuitBreakerRegistry::default();
        assert_eq!(registry.status("order"), None);
        let b = registry.breaker("order");
        assert_eq!(b.config(), BreakerConfig::default());
        assert_eq!(registry.status("order"), Some(CircuitState::Closed));
        assert!(registry.configured().is_empty());
    }

    #[tokio::test]
    async fn sync_reverts_removed_services_without_resetting_state() {
        let registry = CircuitBreakerRegistry::default().with_clock(ManualClock::new());
        let mut configs = HashMap::new();
        configs.insert("basic".to_string(), tight());
        registry.sync(&configs);

        registry.execute("basic", || async { Err::<(), _>("down") }, |_| ()).await;
        assert_eq!(registry.status("basic"), Some(CircuitState::Open));

        registry.sync(&HashMap::new());
        assert!(registry.configured().is_empty());
        assert_eq!(registry.breaker("basic").config(), BreakerConfig::default());
        assert_eq!(registry.status("basic"), Some(CircuitState::Open));
    }

    #[test]
    fn sync_warns_and_skips_invalid_entries() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = CircuitBreakerRegistry::default();
        let mut configs = HashMap::new();
        configs.insert(
            "bad".to_string(),
            BreakerConfig { error_percent_threshold: 150, ..BreakerConfig::default() },
        );
        configs.insert("good".to_string(), tight());
        registry.sync(&configs);

        assert_eq!(registry.configured().keys().collect::<Vec<_>>(), vec!["good"]);
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("invalid breaker config skipped"), "got logs: {logs}");
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = CircuitBreakerRegistry::default();
        registry.breaker("b");
        registry.breaker("a");
        assert_eq!(registry.snapshot().keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
