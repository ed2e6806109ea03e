//! Lock, mutate, publish and consume through the in-memory backends

use ctibus_core::models::{Actor, SseEvent, StreamEvent, WireEvent};
use ctibus_core::service::{EventBuilder, JsonConverter, LockManager, StixConverter};
use ctibus_core::store::{EventLog, KeyValueStore, LockStore, MemoryLog, MemoryStore};
use ctibus_core::{Config, Error, StoreContext};
use ctibus_stream::{StreamBatch, StreamOptions, StreamProcessor, StreamProducer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn context() -> (StoreContext, MemoryLog) {
    let mut config = Config::default();
    config.redis.url = String::new();
    config.concurrency.retry_count = 3;
    config.concurrency.retry_delay_ms = 20;
    config.concurrency.retry_jitter_ms = 5;

    let store = Arc::new(MemoryStore::new());
    let log = MemoryLog::new();
    let ctx = StoreContext::with_stores(
        &config,
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        Arc::new(log.clone()) as Arc<dyn EventLog>,
        vec![store as Arc<dyn LockStore>],
    );
    (ctx, log)
}

fn options() -> StreamOptions {
    let mut options = StreamOptions::default();
    options.block = Duration::from_millis(50);
    options.reconnect_delay = Duration::from_millis(10);
    options
}

fn report(name: &str) -> Value {
    json!({
        "id": "report-7",
        "entity_type": "Report",
        "name": name,
        "modified": "2024-01-01T00:00:00.000Z",
        "i_internal_score": 12
    })
}

async fn collect(rx: &mut mpsc::Receiver<StreamBatch>, expected: usize) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while events.len() < expected {
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("batch in time")
            .expect("processor alive");
        events.extend(batch.events);
    }
    events
}

#[tokio::test]
async fn test_update_is_published_and_reversible() {
    let (ctx, _) = context();
    let locks = LockManager::new(&ctx);
    let producer = StreamProducer::new(&ctx);
    let builder = EventBuilder::default();
    let actor = Actor::new("user-1", "analyst@example.com");

    let (tx, mut rx) = mpsc::channel::<StreamBatch>(8);
    let processor = StreamProcessor::new(&ctx, "e2e", Arc::new(tx), options());
    processor.start(None).await.unwrap();

    let before = report("APT report");
    let after = report("APT29 report");
    let lock = locks.lock(&["report-7"]).await.unwrap();
    let event = builder
        .update_event(&actor, &before, &after, "replaces `APT report` in `name`", None)
        .unwrap()
        .unwrap();
    let id = producer.append(&event).await.unwrap();
    lock.unlock().await;

    let events = collect(&mut rx, 1).await;
    assert_eq!(events[0].id, id);
    assert_eq!(events[0].event, "update");

    let wire: WireEvent = serde_json::from_value(events[0].data.clone()).unwrap();
    let received = StreamEvent::try_from(wire).unwrap();
    assert_eq!(received.data["name"], "APT29 report");
    assert!(received.data.get("i_internal_score").is_none());

    let mut restored = received.data.clone();
    json_patch::patch(&mut restored, received.reverse_patch().unwrap()).unwrap();
    assert_eq!(restored, JsonConverter::new().convert(&before));

    // Idle reads still reach the handler, but carry no further events
    let quiet = tokio::time::Instant::now() + Duration::from_millis(200);
    while let Ok(Some(batch)) = tokio::time::timeout_at(quiet, rx.recv()).await {
        assert!(batch.events.is_empty(), "unexpected event: {:?}", batch.events);
    }

    drop(rx);
    processor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_contended_lock_times_out() {
    let (ctx, _) = context();
    let locks = LockManager::new(&ctx);

    let held = locks.lock(&["report-7"]).await.unwrap();
    let options = locks.default_options().with_retry_count(3);
    let err = locks.acquire(&["report-7"], options).await.unwrap_err();
    match err {
        Error::LockTimeout { resources, attempts } => {
            assert_eq!(resources, vec!["report-7".to_string()]);
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    held.unlock().await;
    locks.lock(&["report-7"]).await.unwrap().unlock().await;
}

#[tokio::test]
async fn test_live_start_skips_history() {
    let (ctx, _) = context();
    let producer = StreamProducer::new(&ctx);
    let builder = EventBuilder::default();
    let actor = Actor::new("user-1", "analyst@example.com");

    let old = builder
        .create_event(&actor, &report("old"), "creates a Report `old`")
        .unwrap();
    producer.append(&old).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<StreamBatch>(8);
    let processor = StreamProcessor::new(&ctx, "live", Arc::new(tx), options());
    processor.start(Some("live")).await.unwrap();

    let new = builder
        .create_event(&actor, &report("new"), "creates a Report `new`")
        .unwrap();
    let new_id = producer.append(&new).await.unwrap();

    let events = collect(&mut rx, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, new_id);
    drop(rx);
    processor.shutdown().await;
}

#[tokio::test]
async fn test_replay_survives_reconnect() {
    let (ctx, log) = context();
    let producer = StreamProducer::new(&ctx);
    let builder = EventBuilder::default();
    let actor = Actor::new("user-1", "analyst@example.com");

    let mut ids = Vec::new();
    for i in 0..5 {
        let event = builder
            .create_event(&actor, &report(&format!("r{i}")), "creates")
            .unwrap();
        ids.push(producer.append(&event).await.unwrap());
    }

    log.fail_next_reads(2);
    let (tx, mut rx) = mpsc::channel::<StreamBatch>(8);
    let processor = StreamProcessor::new(&ctx, "replay", Arc::new(tx), options());
    processor.start(Some("0-0")).await.unwrap();

    let events = collect(&mut rx, 5).await;
    let received: Vec<String> = events.into_iter().map(|e| e.id).collect();
    assert_eq!(received, ids);
    assert!(processor.running());

    drop(rx);
    processor.shutdown().await;
    assert!(!processor.running());
}
