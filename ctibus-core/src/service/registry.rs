//! Ephemeral TTL registries
//!
//! Every entry is an expiring key plus a membership in one or more sorted-set
//! indexes scored by last refresh time. Readers list the index, then fetch
//! each key and skip the ones that already lapsed. Index entries older than
//! the ttl are pruned on every write.

use futures::future::{join_all, try_join_all};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::store::KeyValueStore;
use crate::Result;

/// One live registry entry as returned by [`EphemeralRegistry::keys_from_list`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub redis_key_id: String,
    /// Remaining ttl in seconds at read time
    pub redis_key_ttl: i64,
    #[serde(flatten)]
    pub value: Map<String, Value>,
}

impl RegistryEntry {
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }
}

#[derive(Clone)]
pub struct EphemeralRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for EphemeralRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralRegistry").finish_non_exhaustive()
    }
}

impl EphemeralRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn horizon(&self, ttl_secs: u64) -> (i64, i64) {
        let now = self.store.now_millis();
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        (now, now.saturating_sub(ttl_ms))
    }

    /// Write the value with a ttl and index it in every list
    pub async fn set_key_with_list(
        &self,
        key: &str,
        lists: &[String],
        value: &Value,
        ttl_secs: u64,
    ) -> Result<()> {
        let data = serde_json::to_string(value)?;
        let (now, prune_before) = self.horizon(ttl_secs);
        let members = [key.to_string()];

        let set = self.store.set_ex(key, &data, ttl_secs);
        let indexes = try_join_all(
            lists
                .iter()
                .map(|list| self.store.sorted_add(list, &members, now, prune_before)),
        );
        futures::try_join!(set, indexes)?;
        Ok(())
    }

    /// Refresh the index score of `key` and prune lapsed members
    pub async fn refresh_in_list(&self, list: &str, key: &str, ttl_secs: u64) -> Result<()> {
        let (now, prune_before) = self.horizon(ttl_secs);
        self.store
            .sorted_add(list, &[key.to_string()], now, prune_before)
            .await
    }

    /// Live entries of `list`; with `prune_ttl`, stale index members are
    /// removed first
    pub async fn keys_from_list(&self, list: &str, prune_ttl: Option<u64>) -> Result<Vec<RegistryEntry>> {
        if let Some(ttl) = prune_ttl {
            let (_, prune_before) = self.horizon(ttl);
            self.store.sorted_prune(list, prune_before).await?;
        }
        let keys = self.store.sorted_members(list).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let fetched = join_all(keys.iter().map(|key| self.store.get_with_ttl(key))).await;
        let mut entries = Vec::with_capacity(keys.len());
        for (key, result) in keys.into_iter().zip(fetched) {
            // A value that lapsed between the index read and the fetch is skipped
            let Some((data, ttl)) = result? else {
                continue;
            };
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => entries.push(RegistryEntry {
                    redis_key_id: key,
                    redis_key_ttl: ttl,
                    value: into_object(value),
                }),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable registry entry"),
            }
        }
        Ok(entries)
    }

    /// Raw index members, oldest refresh first
    pub async fn members(&self, list: &str) -> Result<Vec<String>> {
        self.store.sorted_members(list).await
    }

    /// Delete the key and drop it from every list, concurrently
    pub async fn del_key_with_list(&self, key: &str, lists: &[String]) -> Result<()> {
        let del = self.store.del(key);
        let removals = try_join_all(lists.iter().map(|list| self.store.sorted_remove(list, key)));
        futures::try_join!(del, removals)?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<(Value, i64)>> {
        match self.store.get_with_ttl(key).await? {
            Some((data, ttl)) => Ok(Some((serde_json::from_str(&data)?, ttl))),
            None => Ok(None),
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        self.store.expire(key, ttl_secs).await
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        self.store.del(key).await
    }
}

/// Registry values are usually objects; anything else lands under `value`
fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
