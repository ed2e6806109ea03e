//! Redis pub/sub bridge
//!
//! Local publishes are forwarded to `PUBLISH <ns><topic>`; a `PSUBSCRIBE <ns>*`
//! subscriber feeds messages from other nodes into the local [`PubSubHub`].
//! Messages carry the sender's node id so a node never re-delivers its own.

use futures::stream::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ctibus_core::KeyBuilder;

use crate::error::{Error, Result};
use crate::hub::PubSubHub;

const REDIS_TIMEOUT_SECS: u64 = 5;

const INITIAL_BACKOFF_SECS: u64 = 1;

const MAX_BACKOFF_SECS: u64 = 30;

/// A message waiting to be published to Redis
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    node_id: String,
    payload: Value,
}

enum SubscriberExit {
    /// Connected, then the message stream ended
    Disconnected,
    ConnectFailed(Error),
    Cancelled,
}

pub struct RedisBridge {
    redis_client: RedisClient,
    hub: PubSubHub,
    keys: KeyBuilder,
    node_id: String,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for RedisBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBridge")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl RedisBridge {
    /// Publish queue capacity; requests are rejected when it is full
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    pub fn new(redis_url: &str, hub: PubSubHub, keys: KeyBuilder, node_id: String) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Failed to create Redis client: {e}")))?;
        Ok(Self {
            redis_client,
            hub,
            keys,
            node_id,
            cancel_token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down Redis bridge");
        self.cancel_token.cancel();
    }

    /// Spawn the publisher and subscriber tasks
    pub fn start(self: Arc<Self>) -> mpsc::Sender<PublishRequest> {
        let (publish_tx, publish_rx) = mpsc::channel(Self::PUBLISH_CHANNEL_CAPACITY);
        tokio::spawn(Arc::clone(&self).run_publisher(publish_rx));
        tokio::spawn(self.run_subscriber_loop());
        publish_tx
    }

    async fn run_publisher(self: Arc<Self>, mut publish_rx: mpsc::Receiver<PublishRequest>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut retry_request: Option<PublishRequest> = None;

        loop {
            let connect = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                self.redis_client.get_multiplexed_async_connection(),
            );
            let mut conn = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                result = connect => match result {
                    Ok(Ok(conn)) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        conn
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, backoff_secs, "Failed to get Redis connection for publishing, retrying");
                        self.backoff(&mut backoff_secs).await;
                        continue;
                    }
                    Err(_) => {
                        error!(backoff_secs, "Timed out getting Redis connection for publishing, retrying");
                        self.backoff(&mut backoff_secs).await;
                        continue;
                    }
                },
            };
            info!("Redis publisher (re)connected");

            loop {
                let request = match retry_request.take() {
                    Some(request) => request,
                    None => tokio::select! {
                        () = self.cancel_token.cancelled() => return,
                        request = publish_rx.recv() => match request {
                            Some(request) => request,
                            None => {
                                debug!("Publish channel closed, publisher exiting");
                                return;
                            }
                        },
                    },
                };

                match self.publish(&mut conn, &request).await {
                    Ok(receivers) => {
                        debug!(topic = %request.topic, receivers, "Message published to Redis");
                    }
                    Err(e) => {
                        error!(error = %e, topic = %request.topic, "Failed to publish, retrying after reconnect");
                        retry_request = Some(request);
                        break;
                    }
                }
            }
            self.backoff(&mut backoff_secs).await;
        }
    }

    async fn publish(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        request: &PublishRequest,
    ) -> Result<usize> {
        let envelope = Envelope {
            node_id: self.node_id.clone(),
            payload: request.payload.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let channel = self.keys.topic(&request.topic);
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish::<_, _, usize>(&channel, &payload),
        )
        .await
        .map_err(|_| Error::Timeout("publishing to Redis".to_string()))?
        .map_err(|e| Error::Redis(e.to_string()))
    }

    async fn run_subscriber_loop(self: Arc<Self>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        loop {
            match self.run_subscriber().await {
                SubscriberExit::Cancelled => {
                    info!("Redis subscriber cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    error!(backoff_secs = INITIAL_BACKOFF_SECS, "Redis subscriber connection lost, reconnecting");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(error = %e, backoff_secs, "Redis subscriber failed to connect, retrying");
                }
            }
            if !self.backoff(&mut backoff_secs).await {
                return;
            }
        }
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(Error::Redis(e.to_string())),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(
                    "getting Redis pub/sub connection".to_string(),
                ))
            }
        };

        let pattern = self.keys.topic("*");
        match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.psubscribe(&pattern)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(Error::Redis(e.to_string())),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(format!(
                    "subscribing to {pattern}"
                )))
            }
        }
        info!(pattern = %pattern, "Redis subscriber listening");

        let mut messages = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                () = self.cancel_token.cancelled() => return SubscriberExit::Cancelled,
                msg = messages.next() => match msg {
                    Some(msg) => msg,
                    None => return SubscriberExit::Disconnected,
                },
            };

            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };
            self.dispatch(&channel, &payload);
        }
    }

    fn dispatch(&self, channel: &str, payload: &str) {
        let Some(topic) = self.keys.strip(channel) else {
            warn!(channel = %channel, "Message outside the namespace");
            return;
        };
        match serde_json::from_str::<Envelope>(payload) {
            Ok(envelope) if envelope.node_id == self.node_id => {}
            Ok(envelope) => {
                let sent = self.hub.broadcast(topic, &envelope.payload);
                debug!(topic = %topic, from = %envelope.node_id, local_subscribers = sent, "Forwarded Redis message");
            }
            Err(e) => {
                warn!(error = %e, channel = %channel, "Failed to decode message envelope");
            }
        }
    }

    /// Sleep with cancellation, then double the delay; false when cancelled
    async fn backoff(&self, backoff_secs: &mut u64) -> bool {
        let delay = Duration::from_secs(*backoff_secs);
        *backoff_secs = (*backoff_secs * 2).min(MAX_BACKOFF_SECS);
        tokio::select! {
            () = self.cancel_token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
