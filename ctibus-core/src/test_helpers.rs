//! Test helpers and fixtures for ctibus-core tests

use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::Actor;
use crate::store::{EventLog, KeyValueStore, LockStore, MemoryLog, MemoryStore};
use crate::{Config, StoreContext};

/// Config with fast lock retries so contention tests finish quickly
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.redis.url = String::new();
    config.concurrency.retry_count = 3;
    config.concurrency.retry_delay_ms = 20;
    config.concurrency.retry_jitter_ms = 5;
    config
}

/// In-memory context sharing one store for registries and locks
pub fn memory_context() -> StoreContext {
    StoreContext::in_memory(&test_config())
}

/// In-memory context with `replicas` independent lock stores
pub fn replicated_context(replicas: usize) -> (StoreContext, Vec<Arc<MemoryStore>>) {
    let base = Arc::new(MemoryStore::new());
    let lock_stores: Vec<Arc<MemoryStore>> = (0..replicas)
        .map(|i| Arc::new(MemoryStore::named(format!("replica-{i}"))))
        .collect();
    let ctx = StoreContext::with_stores(
        &test_config(),
        base as Arc<dyn KeyValueStore>,
        Arc::new(MemoryLog::new()) as Arc<dyn EventLog>,
        lock_stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn LockStore>)
            .collect(),
    );
    (ctx, lock_stores)
}

pub fn test_actor() -> Actor {
    Actor::new("user-1", "analyst@example.com")
}

/// A minimal exportable object snapshot
pub fn report(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "entity_type": "Report",
        "name": name,
        "modified": "2024-01-01T00:00:00.000Z"
    })
}
