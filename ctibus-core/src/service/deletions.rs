//! Recently deleted resource ids
//!
//! Lock acquisition consults this registry so a writer that waited on a lock
//! held by a deleter does not resurrect the deleted object.

use std::sync::Arc;

use crate::store::KeyValueStore;
use crate::{KeyBuilder, Result, StoreContext};

/// How long a deletion stays visible to lock acquisition
pub const DELETION_WINDOW_SECS: u64 = 120;

#[derive(Clone)]
pub struct DeletionRegistry {
    store: Arc<dyn KeyValueStore>,
    list: String,
}

impl DeletionRegistry {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self::with_store(ctx.store(), ctx.keys())
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn KeyValueStore>, keys: &KeyBuilder) -> Self {
        Self {
            store,
            list: keys.deletions(),
        }
    }

    fn horizon(&self) -> (i64, i64) {
        let now = self.store.now_millis();
        (now, now - (DELETION_WINDOW_SECS as i64) * 1000)
    }

    /// Mark ids as deleted now
    pub async fn add_deletions(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let (now, prune_before) = self.horizon();
        self.store.sorted_add(&self.list, ids, now, prune_before).await
    }

    /// Ids deleted inside the window
    pub async fn latest_deletions(&self) -> Result<Vec<String>> {
        let (_, prune_before) = self.horizon();
        self.store.sorted_prune(&self.list, prune_before).await?;
        self.store.sorted_members(&self.list).await
    }

    /// The subset of `ids` deleted inside the window, in request order
    pub async fn deleted_among(&self, ids: &[String]) -> Result<Vec<String>> {
        let latest = self.latest_deletions().await?;
        Ok(ids.iter().filter(|id| latest.contains(id)).cloned().collect())
    }
}
