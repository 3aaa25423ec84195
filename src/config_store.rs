//! Distributed KV abstraction the gateway reads its live configuration from.
//!
//! Key layout (values are JSON):
//! - `gateway/routes/<prefix>` → route entry
//! - `gateway/hystrix/<service>` → breaker parameters
//! - `gateway/policies/<name>` → authorization rules in CSV form
//!
//! Periodic polling of these prefixes lives in [`crate::reload`].

use async_trait::async_trait;

pub mod memory;
pub use memory::InMemoryConfigStore;

/// Prefix holding route entries.
pub const ROUTES_PREFIX: &str = "gateway/routes/";
/// Prefix holding breaker configs.
pub const BREAKERS_PREFIX: &str = "gateway/hystrix/";
/// Prefix holding authorization rules.
pub const POLICIES_PREFIX: &str = "gateway/policies/";

/// Store key for the route whose prefix is `prefix` (leading `/` optional).
pub fn route_key(prefix: &str) -> String {
    format!("{}{}", ROUTES_PREFIX, prefix.trim_start_matches('/'))
}

/// Store key for the breaker config of `service`.
pub fn breaker_key(service: &str) -> String {
    format!("{}{}", BREAKERS_PREFIX, service)
}

/// One stored key/value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Errors from KV backends.
#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    /// The backend could not be reached or answered with an error.
    #[error("config store unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with something we could not decode.
    #[error("malformed config store response: {0}")]
    Malformed(String),
}

/// Pluggable KV backend (Consul, etcd, in-memory).
#[async_trait]
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    /// All pairs whose key starts with `prefix`, in key order. Missing prefix yields an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, ConfigStoreError>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigStoreError>;

    /// Remove `key`; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError>;
}
