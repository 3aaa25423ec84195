use super::{ConfigStore, ConfigStoreError, KvPair};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// In-memory store for tests and single-node setups.
///
/// Can be switched into an "unavailable" mode to exercise outage handling.
#[derive(Default, Clone, Debug)]
pub struct InMemoryConfigStore {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    unavailable: Arc<AtomicBool>,
    lists: Arc<AtomicUsize>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`ConfigStoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Synchronous insert for test setup.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).insert(key.into(), value.into());
    }

    fn check(&self) -> Result<(), ConfigStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, ConfigStoreError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigStoreError> {
        self.check()?;
        self.insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError> {
        self.check()?;
        self.data.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }
}
