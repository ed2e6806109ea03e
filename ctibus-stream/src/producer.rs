use chrono::{DateTime, Utc};
use ctibus_core::models::{StreamEvent, WireEvent, EVENT_ACTIVITY_VERSION};
use ctibus_core::store::{EventLog, StreamInfo};
use ctibus_core::{Result, StoreContext};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{decode_entry, encode_fields};

/// Appends events to the platform streams
#[derive(Clone)]
pub struct StreamProducer {
    log: Arc<dyn EventLog>,
    stream: String,
    notification_stream: String,
    activity_stream: String,
    trimming: Option<usize>,
    notification_trimming: Option<usize>,
    activity_trimming: Option<usize>,
}

impl std::fmt::Debug for StreamProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProducer")
            .field("stream", &self.stream)
            .field("trimming", &self.trimming)
            .finish_non_exhaustive()
    }
}

/// Zero disables trimming
fn trimming(max_len: usize) -> Option<usize> {
    (max_len > 0).then_some(max_len)
}

impl StreamProducer {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        let config = ctx.config();
        let keys = ctx.keys();
        Self {
            log: ctx.log(),
            stream: keys.stream(&config.stream.name),
            notification_stream: keys.stream(&config.stream.notification_name),
            activity_stream: keys.stream(&config.stream.activity_name),
            trimming: trimming(config.redis.trimming),
            notification_trimming: trimming(config.redis.notification_trimming),
            activity_trimming: trimming(config.redis.activity_trimming),
        }
    }

    /// Namespaced name of the platform stream
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Append an event; returns the assigned stream id
    pub async fn append(&self, event: &StreamEvent) -> Result<String> {
        self.append_wire(&event.to_wire()?).await
    }

    /// Append an already flattened event
    pub async fn append_wire(&self, event: &WireEvent) -> Result<String> {
        let fields = encode_fields(event)?;
        let id = self.log.append(&self.stream, &fields, self.trimming).await?;
        debug!(stream = %self.stream, id = %id, event_type = %event.event_type, "Event appended");
        Ok(id)
    }

    /// First/last ids and size of the platform stream; `None` when empty
    pub async fn stream_info(&self) -> Result<Option<StreamInfo>> {
        self.log.info(&self.stream).await
    }

    pub async fn store_notification_event<T: Serialize + Sync>(&self, event: &T) -> Result<String> {
        let fields = encode_fields(event)?;
        self.log
            .append(&self.notification_stream, &fields, self.notification_trimming)
            .await
    }

    /// Payloads of `live` notifications appended between `start` and `end`
    pub async fn fetch_range_notifications(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let entries = self
            .log
            .range(
                &self.notification_stream,
                &start.timestamp_millis().to_string(),
                &end.timestamp_millis().to_string(),
            )
            .await?;
        let mut notifications = Vec::new();
        for entry in &entries {
            let event = decode_entry(entry)?;
            if event.event == "live" {
                notifications.push(event.data);
            }
        }
        Ok(notifications)
    }

    /// Append an audit event; `version` defaults to the activity format version
    pub async fn store_activity_event<T: Serialize + Sync>(&self, event: &T) -> Result<String> {
        let mut fields = encode_fields(event)?;
        if !fields.iter().any(|(field, _)| field == "version") {
            fields.push(("version".to_string(), serde_json::to_string(EVENT_ACTIVITY_VERSION)?));
        }
        self.log
            .append(&self.activity_stream, &fields, self.activity_trimming)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctibus_core::models::{Actor, EventKind};
    use ctibus_core::Config;
    use serde_json::json;

    fn context() -> StoreContext {
        let mut config = Config::default();
        config.redis.url = String::new();
        config.redis.trimming = 2;
        StoreContext::in_memory(&config)
    }

    #[tokio::test]
    async fn test_append_trims_stream() {
        let ctx = context();
        let producer = StreamProducer::new(&ctx);
        let actor = Actor::new("user-1", "a@example.com");
        for i in 0..3 {
            let event = StreamEvent::new(
                EventKind::Create,
                "creates",
                actor.origin.clone(),
                json!({ "id": format!("report-{i}") }),
            );
            producer.append(&event).await.unwrap();
        }
        let info = producer.stream_info().await.unwrap().unwrap();
        assert_eq!(info.stream_size, 2);

        let entries = ctx.log().range(producer.stream_name(), "-", "+").await.unwrap();
        let first = decode_entry(&entries[0]).unwrap();
        assert_eq!(first.event, "create");
        assert_eq!(first.data["data"]["id"], "report-1");
        assert_eq!(first.data["version"], "4");
    }

    #[tokio::test]
    async fn test_notifications_filtered_to_live() {
        let producer = StreamProducer::new(&context());
        let start = Utc::now() - chrono::Duration::seconds(1);
        producer
            .store_notification_event(&json!({ "type": "live", "notification_id": "n1" }))
            .await
            .unwrap();
        producer
            .store_notification_event(&json!({ "type": "digest", "notification_id": "n2" }))
            .await
            .unwrap();
        let end = Utc::now() + chrono::Duration::seconds(1);

        let live = producer.fetch_range_notifications(start, end).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0]["notification_id"], "n1");
    }

    #[tokio::test]
    async fn test_activity_events_get_version() {
        let ctx = context();
        let producer = StreamProducer::new(&ctx);
        producer
            .store_activity_event(&json!({ "type": "authentication", "event_scope": "login" }))
            .await
            .unwrap();
        let entries = ctx.log().range("stream.activity", "-", "+").await.unwrap();
        assert_eq!(decode_entry(&entries[0]).unwrap().data["version"], "1");
    }

    #[tokio::test]
    async fn test_empty_stream_has_no_info() {
        let producer = StreamProducer::new(&context());
        assert!(producer.stream_info().await.unwrap().is_none());
    }
}
