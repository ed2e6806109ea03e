//! Cluster membership
//!
//! Each node periodically writes a self-description under its node key and
//! scores it in `platform_cluster`. Members that miss heartbeats for
//! [`NODE_TTL_SECS`] disappear from the listing.

use chrono::{DateTime, Utc};
use ctibus_core::keys::CLUSTER_LIST;
use ctibus_core::service::{EphemeralRegistry, RegistryEntry};
use ctibus_core::{KeyBuilder, StoreContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

pub const NODE_TTL_SECS: u64 = 120;

/// What a node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub platform_id: String,
    pub hostname: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeInfo {
    #[must_use]
    pub fn new(platform_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            platform_id: platform_id.into(),
            hostname: hostname.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: now,
            last_heartbeat: now,
        }
    }
}

#[derive(Clone)]
pub struct NodeRegistry {
    registry: EphemeralRegistry,
    keys: KeyBuilder,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").finish_non_exhaustive()
    }
}

impl NodeRegistry {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            registry: EphemeralRegistry::new(ctx.store()),
            keys: ctx.keys().clone(),
        }
    }

    /// Write or refresh this node's entry
    pub async fn register_instance(&self, info: &NodeInfo) -> Result<()> {
        let value = serde_json::to_value(info)?;
        self.registry
            .set_key_with_list(
                &self.keys.cluster_node(&info.platform_id),
                &[self.keys.cluster()],
                &value,
                NODE_TTL_SECS,
            )
            .await?;
        Ok(())
    }

    /// Live members, lapsed ones pruned first
    pub async fn get_instances(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .registry
            .keys_from_list(&self.keys.cluster(), Some(NODE_TTL_SECS))
            .await?)
    }

    pub async fn unregister_instance(&self, platform_id: &str) -> Result<()> {
        self.registry
            .del_key_with_list(&self.keys.cluster_node(platform_id), &[self.keys.cluster()])
            .await?;
        Ok(())
    }

    /// Re-register every `interval` until cancelled, then leave the cluster
    pub fn spawn_heartbeat(
        &self,
        mut info: NodeInfo,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!(platform_id = %info.platform_id, interval = ?interval, "Cluster heartbeat started");
            loop {
                info.last_heartbeat = Utc::now();
                match registry.register_instance(&info).await {
                    Ok(()) => debug!(platform_id = %info.platform_id, "Heartbeat sent"),
                    Err(e) => warn!(platform_id = %info.platform_id, error = %e, "Heartbeat failed"),
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            if let Err(e) = registry.unregister_instance(&info.platform_id).await {
                warn!(platform_id = %info.platform_id, error = %e, "Failed to leave cluster");
            }
            info!(platform_id = %info.platform_id, "Cluster heartbeat stopped");
        })
    }
}

/// Name for nodes configured without an explicit id
#[must_use]
pub fn default_node_id(hostname: &str) -> String {
    format!("{CLUSTER_LIST}:{hostname}:{}", nanoid_suffix())
}

fn nanoid_suffix() -> String {
    ctibus_core::models::generate_token().chars().take(8).collect()
}
