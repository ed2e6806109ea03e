//! Stream consumer
//!
//! A [`StreamProcessor`] tails one stream from a cursor and hands decoded
//! batches to a [`StreamHandler`]. The next read only starts once the handler
//! returned, so a slow handler throttles the reader. The cursor moves past a
//! batch only after the handler accepted it.

use async_trait::async_trait;
use ctibus_core::config::StreamConfig;
use ctibus_core::models::SseEvent;
use ctibus_core::store::{EventLog, LogReader, RawEntry, StreamInfo};
use ctibus_core::{Error, Result, StoreContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_entry, is_external};

/// Start from the current end of the stream
pub const LIVE: &str = "live";

/// Receives decoded batches in stream order
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// `last_event_id` is the id of the last delivered event, or `<now>-0`
    /// when the batch is empty
    async fn on_batch(&self, events: Vec<SseEvent>, last_event_id: String) -> Result<()>;
}

/// Batch forwarded through a channel
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub events: Vec<SseEvent>,
    pub last_event_id: String,
}

#[async_trait]
impl StreamHandler for mpsc::Sender<StreamBatch> {
    async fn on_batch(&self, events: Vec<SseEvent>, last_event_id: String) -> Result<()> {
        self.send(StreamBatch {
            events,
            last_event_id,
        })
        .await
        .map_err(|_| Error::NotRunning("batch receiver dropped".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Raw stream name, the namespace is applied by the processor
    pub stream_name: String,
    pub with_internal: bool,
    pub auto_reconnect: bool,
    pub batch_size: usize,
    pub block: Duration,
    pub reconnect_delay: Duration,
}

impl StreamOptions {
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            stream_name: config.name.clone(),
            with_internal: config.with_internal,
            auto_reconnect: true,
            batch_size: config.batch_size,
            block: config.block_time(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = stream_name.into();
        self
    }

    #[must_use]
    pub const fn with_internal(mut self, with_internal: bool) -> Self {
        self.with_internal = with_internal;
        self
    }

    #[must_use]
    pub const fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

pub struct StreamProcessor {
    provider: String,
    log: Arc<dyn EventLog>,
    stream: String,
    handler: Arc<dyn StreamHandler>,
    options: StreamOptions,
    listening: Arc<AtomicBool>,
    cancel: CancellationToken,
    cursor: Arc<Mutex<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("provider", &self.provider)
            .field("stream", &self.stream)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StreamProcessor {
    pub fn new(
        ctx: &StoreContext,
        provider: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
        options: StreamOptions,
    ) -> Self {
        Self {
            provider: provider.into(),
            log: ctx.log(),
            stream: ctx.keys().stream(&options.stream_name),
            handler,
            options,
            listening: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            cursor: Arc::new(Mutex::new(String::new())),
            task: Mutex::new(None),
        }
    }

    /// Start consuming after `start_event_id`. `None` or [`LIVE`] starts at
    /// the current end of the stream; any other id replays what follows it.
    pub async fn start(&self, start_event_id: Option<&str>) -> Result<()> {
        if self.listening.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput(format!(
                "processor {} is already running",
                self.provider
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::NotRunning(format!("processor {} was shut down", self.provider)));
        }

        let from = match start_event_id {
            None | Some(LIVE) => self
                .log
                .last_id(&self.stream)
                .await?
                .unwrap_or_else(|| "0-0".to_string()),
            Some(id) if ctibus_core::store::parse_stream_id(id).is_some() => id.to_string(),
            Some(id) => return Err(Error::InvalidInput(format!("invalid stream id: {id}"))),
        };
        *self.cursor.lock() = from.clone();

        let reader = self.log.open_reader().await?;
        self.listening.store(true, Ordering::SeqCst);
        info!(provider = %self.provider, stream = %self.stream, from = %from, "Starting stream processor");

        let worker = Worker {
            provider: self.provider.clone(),
            log: Arc::clone(&self.log),
            stream: self.stream.clone(),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
            listening: Arc::clone(&self.listening),
            cancel: self.cancel.clone(),
            cursor: Arc::clone(&self.cursor),
        };
        *self.task.lock() = Some(tokio::spawn(worker.run(reader)));
        Ok(())
    }

    /// Stop reading and wait for the loop to finish its current batch
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(provider = %self.provider, error = %e, "Stream processor task failed");
            }
        }
        self.listening.store(false, Ordering::SeqCst);
        info!(provider = %self.provider, "Stream processor stopped");
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Id after which the next read starts
    #[must_use]
    pub fn cursor(&self) -> String {
        self.cursor.lock().clone()
    }

    pub async fn info(&self) -> Result<Option<StreamInfo>> {
        self.log.info(&self.stream).await
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    provider: String,
    log: Arc<dyn EventLog>,
    stream: String,
    handler: Arc<dyn StreamHandler>,
    options: StreamOptions,
    listening: Arc<AtomicBool>,
    cancel: CancellationToken,
    cursor: Arc<Mutex<String>>,
}

impl Worker {
    async fn run(self, mut reader: Box<dyn LogReader>) {
        loop {
            if let Err(e) = self.step(reader.as_mut()).await {
                if self.cancel.is_cancelled() {
                    break;
                }
                if !self.options.auto_reconnect {
                    error!(provider = %self.provider, error = %e, "Stream processing failed, stopping");
                    break;
                }
                warn!(
                    provider = %self.provider,
                    error = %e,
                    delay = ?self.options.reconnect_delay,
                    "Stream processing failed, reconnecting"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(self.options.reconnect_delay) => {}
                }
                reader.close().await;
                reader = match self.log.open_reader().await {
                    Ok(reader) => reader,
                    Err(e) => {
                        error!(provider = %self.provider, error = %e, "Failed to reopen stream reader");
                        break;
                    }
                };
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        self.listening.store(false, Ordering::SeqCst);
        reader.close().await;
        debug!(provider = %self.provider, "Stream loop exited");
    }

    /// One read followed by one handler call
    async fn step(&self, reader: &mut dyn LogReader) -> Result<()> {
        let after = self.cursor.lock().clone();
        let entries = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            read = reader.read(&self.stream, &after, self.options.batch_size, self.options.block) => read?,
        };
        let last_raw_id = entries.last().map(|entry| entry.id.clone());

        // Empty reads still reach the handler so it can checkpoint
        let events = self.filter(&entries);
        let last_event_id = events.last().map_or_else(
            || format!("{}-0", chrono::Utc::now().timestamp_millis()),
            |event| event.id.clone(),
        );
        self.handler.on_batch(events, last_event_id).await?;
        if let Some(id) = last_raw_id {
            *self.cursor.lock() = id;
        }
        Ok(())
    }

    fn filter(&self, entries: &[RawEntry]) -> Vec<SseEvent> {
        entries
            .iter()
            .filter_map(|entry| match decode_entry(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(provider = %self.provider, id = %entry.id, error = %e, "Skipping undecodable stream entry");
                    None
                }
            })
            .filter(|event| self.options.with_internal || is_external(event))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctibus_core::store::{LockStore, MemoryLog, MemoryStore};
    use ctibus_core::Config;

    fn context() -> (StoreContext, MemoryLog) {
        let mut config = Config::default();
        config.redis.url = String::new();
        let log = MemoryLog::new();
        let store = Arc::new(MemoryStore::new());
        let ctx = StoreContext::with_stores(&config, store.clone(), Arc::new(log.clone()), vec![store as Arc<dyn LockStore>]);
        (ctx, log)
    }

    fn options() -> StreamOptions {
        let mut options = StreamOptions::default();
        options.block = Duration::from_millis(50);
        options.reconnect_delay = Duration::from_millis(10);
        options
    }

    async fn append(log: &MemoryLog, event_type: &str, scope: &str) -> String {
        let fields = vec![
            ("type".to_string(), format!("\"{event_type}\"")),
            ("scope".to_string(), format!("\"{scope}\"")),
        ];
        log.append("stream.platform", &fields, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_internal_events_filtered() {
        let (ctx, log) = context();
        let (tx, mut rx) = mpsc::channel::<StreamBatch>(8);
        let processor = StreamProcessor::new(&ctx, "test", Arc::new(tx), options());
        processor.start(Some("0")).await.unwrap();

        append(&log, "create", "internal").await;
        let external = append(&log, "update", "external").await;

        let mut delivered = Vec::new();
        while delivered.is_empty() {
            let batch = rx.recv().await.unwrap();
            delivered.extend(batch.events);
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, external);
        drop(rx);
        processor.shutdown().await;
        assert!(!processor.running());
    }

    #[tokio::test]
    async fn test_filtered_batch_reports_synthetic_id() {
        let (ctx, log) = context();
        append(&log, "create", "internal").await;

        let (tx, mut rx) = mpsc::channel::<StreamBatch>(8);
        let processor = StreamProcessor::new(&ctx, "test", Arc::new(tx), options());
        processor.start(Some("0-0")).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert!(batch.events.is_empty());
        assert!(batch.last_event_id.ends_with("-0"));
        drop(rx);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cursor_waits_for_handler() {
        struct Failing;

        #[async_trait]
        impl StreamHandler for Failing {
            async fn on_batch(&self, _: Vec<SseEvent>, _: String) -> Result<()> {
                Err(Error::Internal("handler failed".to_string()))
            }
        }

        let (ctx, log) = context();
        append(&log, "create", "external").await;
        let processor = StreamProcessor::new(
            &ctx,
            "test",
            Arc::new(Failing),
            options().with_auto_reconnect(false),
        );
        processor.start(Some("0-0")).await.unwrap();

        for _ in 0..100 {
            if !processor.running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!processor.running());
        assert_eq!(processor.cursor(), "0-0");
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (ctx, _) = context();
        let (tx, _rx) = mpsc::channel::<StreamBatch>(8);
        let processor = StreamProcessor::new(&ctx, "test", Arc::new(tx), options());
        processor.start(None).await.unwrap();
        assert!(matches!(processor.start(None).await, Err(Error::InvalidInput(_))));
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_start_id() {
        let (ctx, _) = context();
        let (tx, _rx) = mpsc::channel::<StreamBatch>(8);
        let processor = StreamProcessor::new(&ctx, "test", Arc::new(tx), options());
        assert!(processor.start(Some("yesterday")).await.is_err());
        assert!(!processor.running());
    }
}
