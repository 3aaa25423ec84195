//! etcd-backed [`ConfigStore`] for `mulegate` (companion crate).
//! Bring your own `etcd_client::Client`; keys use the same layout as every other store.

use async_trait::async_trait;
use etcd_client::{DeleteOptions, GetOptions, SortOrder, SortTarget};
use mulegate::config_store::{ConfigStore, ConfigStoreError, KvPair};

#[derive(Clone)]
pub struct EtcdStore {
    client: etcd_client::Client,
    /// Prepended to every key, so several gateways can share one cluster.
    namespace: String,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("namespace", &self.namespace)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

impl EtcdStore {
    /// Store over an existing client with no key namespace.
    pub fn new(client: etcd_client::Client) -> Self {
        Self { client, namespace: String::new() }
    }

    /// Store whose keys live under `namespace/`.
    ///
    /// # Errors
    /// Returns `Err` if the namespace is empty or contains control characters.
    pub fn with_namespace(
        client: etcd_client::Client,
        namespace: impl Into<String>,
    ) -> Result<Self, String> {
        let ns: String = namespace.into();
        let ns = ns.trim().trim_end_matches('/').to_string();
        if ns.is_empty() {
            return Err("namespace cannot be empty".to_string());
        }
        if ns.chars().any(|c| c.is_control()) {
            return Err("namespace cannot contain control characters".to_string());
        }
        Ok(Self { client, namespace: format!("{ns}/") })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

fn unavailable(e: etcd_client::Error) -> ConfigStoreError {
    ConfigStoreError::Unavailable(e.to_string())
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, ConfigStoreError> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client.get(self.full_key(prefix), Some(options)).await.map_err(unavailable)?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|e| ConfigStoreError::Malformed(format!("non-utf8 key: {e}")))?;
            match key.strip_prefix(self.namespace.as_str()) {
                Some(key) => pairs.push(KvPair::new(key, kv.value().to_vec())),
                None => {
                    tracing::warn!(target: "mulegate::etcd", key = %key, "key outside namespace skipped");
                }
            }
        }
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigStoreError> {
        let mut client = self.client.clone();
        client.put(self.full_key(key), value, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError> {
        let mut client = self.client.clone();
        client
            .delete(self.full_key(key), None::<DeleteOptions>)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
