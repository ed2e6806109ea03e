//! Connector work progress counters
//!
//! A work is a hash keyed by its id. Connectors report each processed bundle;
//! the platform records how many it expects. Work ids shaped
//! `work_<connector>_<suffix>` also publish the connector's latest work under
//! `work:<connector>`.

use futures::future::try_join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::KeyValueStore;
use crate::{KeyBuilder, Result, StoreContext};

pub const PROCESSED_FIELD: &str = "import_processed_number";
pub const EXPECTED_FIELD: &str = "import_expected_number";
pub const LAST_PROCESSED_FIELD: &str = "import_last_processed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkStatus {
    pub is_complete: bool,
    pub total: i64,
    /// Unknown until an expectation was recorded
    pub expected: Option<i64>,
}

#[derive(Clone)]
pub struct WorkService {
    store: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
}

impl WorkService {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            store: ctx.store(),
            keys: ctx.keys().clone(),
        }
    }

    /// Count one processed element and report whether the work is complete
    pub async fn update_work_figures(&self, work_id: &str) -> Result<WorkStatus> {
        if let Some(connector_id) = work_id.split('_').nth(1) {
            self.store
                .set(&self.keys.connector_work(connector_id), work_id)
                .await?;
        }

        let key = self.keys.work(work_id);
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let total = self.store.hash_incr(&key, PROCESSED_FIELD, 1).await?;
        self.store
            .hash_set(&key, &[(LAST_PROCESSED_FIELD.to_string(), timestamp)])
            .await?;

        let figures = self.store.hash_get_all(&key).await?;
        let expected = figures.get(EXPECTED_FIELD).and_then(|v| v.parse::<i64>().ok());
        Ok(WorkStatus {
            is_complete: expected == Some(total),
            total,
            expected,
        })
    }

    /// Raise the number of elements the work is expected to process
    pub async fn update_action_expectation(&self, work_id: &str, expectation: i64) -> Result<i64> {
        self.store
            .hash_incr(&self.keys.work(work_id), EXPECTED_FIELD, expectation)
            .await
    }

    pub async fn get_work(&self, work_id: &str) -> Result<HashMap<String, String>> {
        self.store.hash_get_all(&self.keys.work(work_id)).await
    }

    /// Latest work id reported for the connector
    pub async fn get_connector_status(&self, connector_id: &str) -> Result<Option<String>> {
        self.store.get(&self.keys.connector_work(connector_id)).await
    }

    pub async fn delete_works(&self, work_ids: &[String]) -> Result<()> {
        try_join_all(work_ids.iter().map(|id| {
            let key = self.keys.work(id);
            let store = Arc::clone(&self.store);
            async move { store.del(&key).await }
        }))
        .await?;
        Ok(())
    }
}
