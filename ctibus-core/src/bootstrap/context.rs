//! Store connections shared by every service

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::store::{EventLog, KeyValueStore, LockStore, MemoryLog, MemoryStore, RedisStore};
use crate::{Config, KeyBuilder, Result};

/// Explicitly constructed handle to the base store, the event log and the
/// lock replicas. Clone it freely; services hold their own copy.
#[derive(Clone)]
pub struct StoreContext {
    config: Arc<Config>,
    keys: KeyBuilder,
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn EventLog>,
    lock_stores: Vec<Arc<dyn LockStore>>,
    redis: Vec<Arc<RedisStore>>,
}

impl StoreContext {
    /// Connect to Redis, or build in-memory stores in local-only mode
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.is_local_only() {
            info!("Running in local-only mode (no Redis)");
            return Ok(Self::in_memory(config));
        }

        let timeout = Duration::from_secs(config.redis.connect_timeout_seconds);
        let base = Arc::new(RedisStore::connect(&config.redis.url, timeout).await?);
        let mut redis = vec![Arc::clone(&base)];
        let mut lock_stores: Vec<Arc<dyn LockStore>> = Vec::new();

        for url in config.lock_urls() {
            if url == config.redis.url {
                lock_stores.push(base.clone());
            } else {
                let replica = Arc::new(RedisStore::connect(&url, timeout).await?);
                redis.push(Arc::clone(&replica));
                lock_stores.push(replica);
            }
        }

        info!(lock_replicas = lock_stores.len(), "Store context initialized");

        Ok(Self {
            config: Arc::new(config.clone()),
            keys: KeyBuilder::from_config(config),
            store: base.clone(),
            log: base,
            lock_stores,
            redis,
        })
    }

    /// Single-process stores; one memory store doubles as the lock replica
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_stores(
            config,
            store.clone(),
            Arc::new(MemoryLog::new()),
            vec![store as Arc<dyn LockStore>],
        )
    }

    /// Assemble a context from arbitrary backends
    #[must_use]
    pub fn with_stores(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        log: Arc<dyn EventLog>,
        lock_stores: Vec<Arc<dyn LockStore>>,
    ) -> Self {
        Self {
            config: Arc::new(config.clone()),
            keys: KeyBuilder::from_config(config),
            store,
            log,
            lock_stores,
            redis: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    #[must_use]
    pub fn lock_stores(&self) -> &[Arc<dyn LockStore>] {
        &self.lock_stores
    }

    /// Liveness of the base store
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub async fn server_version(&self) -> Result<String> {
        self.store.server_version().await
    }

    /// Mark Redis connections closed. Locks released afterwards are skipped.
    pub fn close(&self) {
        for store in &self.redis {
            store.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_only_connect_uses_memory() {
        let mut config = Config::default();
        config.redis.url = String::new();
        config.redis.namespace = "t".to_string();

        let ctx = StoreContext::connect(&config).await.unwrap();
        assert_eq!(ctx.lock_stores().len(), 1);
        assert_eq!(ctx.keys().sessions(), "t:platform_sessions");
        assert!(ctx.ping().await.is_ok());
        assert!(ctx.server_version().await.unwrap().starts_with("memory-"));
    }

    #[tokio::test]
    async fn test_memory_store_shared_between_roles() {
        let ctx = StoreContext::in_memory(&Config::default());
        ctx.store().set("{locks}:a", "token").await.unwrap();
        // The lock replica sees the key written through the base store
        let acquired = ctx.lock_stores()[0]
            .try_acquire(&["{locks}:a".to_string()], "other", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!acquired);
    }
}
