//! Unified entry point for topic fan-out
//!
//! Every publish reaches local subscribers right away. With Redis configured,
//! it is also forwarded to the other nodes through the [`RedisBridge`].

use ctibus_core::models::Actor;
use ctibus_core::StoreContext;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{PublishRequest, RedisBridge};
use crate::error::{Error, Result};
use crate::hub::{PubSubHub, Subscription};

pub struct EventBus {
    hub: PubSubHub,
    node_id: String,
    publish_tx: Option<mpsc::Sender<PublishRequest>>,
    bridge: Option<Arc<RedisBridge>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("node_id", &self.node_id)
            .field("distributed", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Single-node bus
    #[must_use]
    pub fn local(node_id: impl Into<String>) -> Self {
        Self {
            hub: PubSubHub::new(),
            node_id: node_id.into(),
            publish_tx: None,
            bridge: None,
        }
    }

    /// Bus matching the context: local-only without Redis, bridged otherwise.
    /// Must be called inside a tokio runtime.
    pub fn new(ctx: &StoreContext, node_id: impl Into<String>) -> Result<Self> {
        let node_id = node_id.into();
        let config = ctx.config();
        if config.is_local_only() {
            warn!("Redis URL not provided, pub/sub running in single-node mode");
            return Ok(Self::local(node_id));
        }

        let hub = PubSubHub::new();
        let bridge = Arc::new(RedisBridge::new(
            &config.redis.url,
            hub.clone(),
            ctx.keys().clone(),
            node_id.clone(),
        )?);
        let publish_tx = Arc::clone(&bridge).start();
        info!(node_id = %node_id, "Pub/sub bridged through Redis");
        Ok(Self {
            hub,
            node_id,
            publish_tx: Some(publish_tx),
            bridge: Some(bridge),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn hub(&self) -> &PubSubHub {
        &self.hub
    }

    /// Publish to local subscribers and, when bridged, to the cluster.
    /// Returns the number of local receivers.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<usize> {
        let payload = serde_json::to_value(payload)?;
        let local = self.hub.broadcast(topic, &payload);

        if let Some(tx) = &self.publish_tx {
            tx.try_send(PublishRequest {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Closed(format!("publish queue full, dropping message on {topic}"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Closed("publisher task stopped".to_string())
                }
            })?;
        }
        debug!(topic = %topic, local_subscribers = local, "Published");
        Ok(local)
    }

    pub fn subscribe(&self, pattern: impl Into<String>) -> Result<Subscription> {
        self.hub.subscribe(pattern)
    }

    /// Publish `{instance, user}`; nothing is sent without an instance
    pub fn notify(&self, topic: &str, instance: Option<&Value>, actor: &Actor) -> Result<Option<usize>> {
        let Some(instance) = instance else {
            return Ok(None);
        };
        let message = json!({ "instance": instance, "user": actor });
        self.publish(topic, &message).map(Some)
    }

    pub fn shutdown(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
    }
}
