//! Service discovery: logical service name → base URL of a live instance.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;

/// Errors from discovery backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The backend knows no healthy instance.
    #[error("no healthy instance of '{service}'")]
    NoInstance { service: String },
    /// The backend itself failed.
    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves service names to instance base URLs such as `http://10.0.0.7:8001`.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, service: &str) -> Result<String, DiscoveryError>;
}

/// Fixed name → instances mapping, picking a random instance per call.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<String>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance for `service`.
    pub fn with_instance(mut self, service: impl Into<String>, base_url: impl Into<String>) -> Self {
        let url: String = base_url.into();
        self.services
            .entry(service.into())
            .or_default()
            .push(url.trim_end_matches('/').to_string());
        self
    }

    /// Parse `name=url,name=url` (repeated names add instances).
    pub fn parse(spec: &str) -> Result<Self, String> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .try_fold(Self::new(), |acc, item| match item.split_once('=') {
                Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                    Ok(acc.with_instance(name.trim(), url.trim()))
                }
                _ => Err(format!("expected name=url, got '{item}'")),
            })
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, service: &str) -> Result<String, DiscoveryError> {
        match self.services.get(service) {
            Some(list) if !list.is_empty() => {
                let idx = rand::rng().random_range(0..list.len());
                Ok(list[idx].clone())
            }
            _ => Err(DiscoveryError::NoInstance { service: service.to_string() }),
        }
    }
}
