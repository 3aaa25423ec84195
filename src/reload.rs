//! Periodic refresh of routes, breaker parameters and policies from the config store.
//!
//! Each part is fetched and applied independently. A part whose fetch fails
//! keeps its previous value, so a store outage degrades to serving the last
//! known good configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authz::{MemoryPolicyEngine, PolicySet};
use crate::circuit_breaker::BreakerConfig;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::config_store::{
    ConfigStore, ConfigStoreError, BREAKERS_PREFIX, POLICIES_PREFIX, ROUTES_PREFIX,
};
use crate::routing::{RouteTable, Routes};

/// What one reload installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub routes: usize,
    pub breakers: usize,
    /// `None` when no policy engine is attached.
    pub policy_rules: Option<usize>,
}

/// Pulls configuration from a [`ConfigStore`] into the live gateway state.
#[derive(Debug)]
pub struct ConfigReloader {
    store: Arc<dyn ConfigStore>,
    routes: Routes,
    breakers: Arc<CircuitBreakerRegistry>,
    policies: Option<MemoryPolicyEngine>,
    local_policies: Option<String>,
    bootstrap_routes: Option<RouteTable>,
}

impl ConfigReloader {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        routes: Routes,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self { store, routes, breakers, policies: None, local_policies: None, bootstrap_routes: None }
    }

    /// Also refresh `engine` from `gateway/policies/`, with `local` rules (for
    /// example a policy file) always included first.
    pub fn with_policies(mut self, engine: MemoryPolicyEngine, local: Option<String>) -> Self {
        self.policies = Some(engine);
        self.local_policies = local;
        self
    }

    /// Serve `table` while the store holds no routes.
    pub fn with_bootstrap_routes(mut self, table: RouteTable) -> Self {
        self.bootstrap_routes = Some(table);
        self
    }

    /// Fetch and apply everything once. Parts that loaded are applied even when
    /// another part fails; the first failure is returned.
    pub async fn reload(&self) -> Result<ReloadReport, ConfigStoreError> {
        let mut report = ReloadReport::default();
        let mut first_err = None;

        match self.reload_routes().await {
            Ok(n) => report.routes = n,
            Err(e) => {
                warn!(target: "mulegate::reload", error = %e, "route reload failed; keeping previous table");
                first_err.get_or_insert(e);
            }
        }
        match self.reload_breakers().await {
            Ok(n) => report.breakers = n,
            Err(e) => {
                warn!(target: "mulegate::reload", error = %e, "breaker config reload failed; keeping previous configs");
                first_err.get_or_insert(e);
            }
        }
        match self.reload_policies().await {
            Ok(n) => report.policy_rules = n,
            Err(e) => {
                warn!(target: "mulegate::reload", error = %e, "policy reload failed; keeping previous rules");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(target: "mulegate::reload", routes = report.routes, breakers = report.breakers, "configuration reloaded");
                Ok(report)
            }
        }
    }

    async fn reload_routes(&self) -> Result<usize, ConfigStoreError> {
        let pairs = self.store.list(ROUTES_PREFIX).await?;
        let mut table = RouteTable::from_pairs(&pairs);
        if table.is_empty() {
            if let Some(bootstrap) = &self.bootstrap_routes {
                table = bootstrap.clone();
            }
        }
        let count = table.len();
        if *self.routes.snapshot() != table {
            info!(target: "mulegate::reload", routes = count, "route table replaced");
            self.routes.replace(table);
        }
        Ok(count)
    }

    async fn reload_breakers(&self) -> Result<usize, ConfigStoreError> {
        let pairs = self.store.list(BREAKERS_PREFIX).await?;
        let current = self.breakers.configured();
        let mut configs = HashMap::with_capacity(pairs.len());
        for pair in &pairs {
            let service = pair.key.strip_prefix(BREAKERS_PREFIX).unwrap_or(&pair.key);
            if service.is_empty() {
                continue;
            }
            match serde_json::from_slice::<BreakerConfig>(&pair.value) {
                Ok(config) => {
                    configs.insert(service.to_string(), config);
                }
                Err(e) => {
                    warn!(target: "mulegate::reload", key = %pair.key, error = %e, "unparsable breaker config skipped");
                    if let Some(previous) = current.get(service) {
                        configs.insert(service.to_string(), *previous);
                    }
                }
            }
        }
        self.breakers.sync(&configs);
        Ok(self.breakers.configured().len())
    }

    async fn reload_policies(&self) -> Result<Option<usize>, ConfigStoreError> {
        let Some(engine) = &self.policies else {
            return Ok(None);
        };
        let pairs = self.store.list(POLICIES_PREFIX).await?;
        let texts: Vec<(String, String)> = self
            .local_policies
            .iter()
            .map(|text| ("policy-file".to_string(), text.clone()))
            .chain(
                pairs
                    .iter()
                    .map(|p| (p.key.clone(), String::from_utf8_lossy(&p.value).into_owned())),
            )
            .collect();
        let set = PolicySet::from_sources(texts.iter().map(|(n, t)| (n.as_str(), t.as_str())));
        let rules = set.rule_count();
        engine.replace(set);
        Ok(Some(rules))
    }

    /// Reload every `interval` until `cancel` fires. Failures are logged and retried
    /// on the next tick.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            info!(target: "mulegate::reload", interval_secs = interval.as_secs(), "config watcher started");
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(target: "mulegate::reload", "config watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        // Errors are already logged per part.
                        let _ = self.reload().await;
                    }
                }
            }
        })
    }
}
