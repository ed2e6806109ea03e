//! In-process backends for local-only mode and tests
//!
//! Time is measured with `tokio::time::Instant`, so paused-clock tests can move
//! TTLs forward with `tokio::time::advance`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;

use super::{parse_stream_id, EventLog, KeyValueStore, LockStore, LogReader, RawEntry, StreamInfo};
use crate::{Error, Result};

/// Epoch-millisecond clock driven by the tokio clock
#[derive(Debug, Clone, Copy)]
pub struct MemoryClock {
    started: Instant,
    started_ms: i64,
}

impl MemoryClock {
    #[must_use]
    pub fn new() -> Self {
        let started_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self {
            started: Instant::now(),
            started_ms,
        }
    }

    #[must_use]
    pub fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.started_ms.saturating_add(elapsed)
    }
}

impl Default for MemoryClock {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
struct Value {
    data: String,
    expires_at: Option<i64>,
}

impl Value {
    fn alive(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct KvState {
    values: HashMap<String, Value>,
    sorted: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl KvState {
    fn live(&mut self, key: &str, now: i64) -> Option<&Value> {
        if self.values.get(key).is_some_and(|v| !v.alive(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn prune(&mut self, list: &str, before: i64) {
        if let Some(members) = self.sorted.get_mut(list) {
            members.retain(|_, score| *score > before);
            if members.is_empty() {
                self.sorted.remove(list);
            }
        }
    }
}

/// Key/value and lock store held in process memory
///
/// Serves as the base store and as a lock replica in local-only mode. Several
/// instances can stand in for independent lock replicas.
pub struct MemoryStore {
    name: String,
    clock: MemoryClock,
    state: Mutex<KvState>,
    ready: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: MemoryClock::new(),
            state: Mutex::new(KvState::default()),
            ready: AtomicBool::new(true),
        }
    }

    /// Simulate a closed connection: lock calls fail and `is_ready` is false
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Store(format!("{} is not connected", self.name)))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires_at = self.now_millis() + millis(Duration::from_secs(ttl_secs));
        self.state.lock().values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now_millis();
        Ok(self.state.lock().live(key, now).map(|v| v.data.clone()))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, i64)>> {
        let now = self.now_millis();
        let mut state = self.state.lock();
        Ok(state.live(key, now).map(|v| (v.data.clone(), remaining_secs(v, now))))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let now = self.now_millis();
        let mut state = self.state.lock();
        Ok(state.live(key, now).map_or(-2, |v| remaining_secs(v, now)))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let now = self.now_millis();
        let mut state = self.state.lock();
        if state.live(key, now).is_none() {
            return Ok(false);
        }
        if let Some(value) = state.values.get_mut(key) {
            value.expires_at = Some(now + millis(Duration::from_secs(ttl_secs)));
        }
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state.values.remove(key).is_some()
            | state.sorted.remove(key).is_some()
            | state.hashes.remove(key).is_some();
        Ok(removed)
    }

    async fn sorted_add(
        &self,
        list: &str,
        members: &[String],
        score: i64,
        prune_before: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let set = state.sorted.entry(list.to_string()).or_default();
        for member in members {
            set.insert(member.clone(), score);
        }
        state.prune(list, prune_before);
        Ok(())
    }

    async fn sorted_prune(&self, list: &str, prune_before: i64) -> Result<()> {
        self.state.lock().prune(list, prune_before);
        Ok(())
    }

    async fn sorted_members(&self, list: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let Some(set) = state.sorted.get(list) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &i64)> = set.iter().collect();
        members.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn sorted_remove(&self, list: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(set) = state.sorted.get_mut(list) {
            set.remove(member);
            if set.is_empty() {
                state.sorted.remove(list);
            }
        }
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::InvalidInput(format!("hash value is not an integer: {key}.{field}")))?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_ready()
    }

    async fn server_version(&self) -> Result<String> {
        Ok(format!("memory-{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Redis TTL reports whole seconds, rounded
fn remaining_secs(value: &Value, now: i64) -> i64 {
    value.expires_at.map_or(-1, |at| (at - now + 500) / 1000)
}

#[async_trait]
impl LockStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool> {
        self.ensure_ready()?;
        let now = self.now_millis();
        let mut state = self.state.lock();
        for key in keys {
            if state.live(key, now).is_some() {
                return Ok(false);
            }
        }
        for key in keys {
            state.values.insert(
                key.clone(),
                Value {
                    data: token.to_string(),
                    expires_at: Some(now + millis(ttl)),
                },
            );
        }
        Ok(true)
    }

    async fn extend(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool> {
        self.ensure_ready()?;
        let now = self.now_millis();
        let mut state = self.state.lock();
        for key in keys {
            if state.live(key, now).is_none_or(|v| v.data != token) {
                return Ok(false);
            }
        }
        for key in keys {
            if let Some(value) = state.values.get_mut(key) {
                value.expires_at = Some(now + millis(ttl));
            }
        }
        Ok(true)
    }

    async fn release(&self, keys: &[String], token: &str) -> Result<bool> {
        self.ensure_ready()?;
        let now = self.now_millis();
        let mut state = self.state.lock();
        let mut released = false;
        for key in keys {
            if state.live(key, now).is_some_and(|v| v.data == token) {
                state.values.remove(key);
                released = true;
            }
        }
        Ok(released)
    }
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<(u64, u64), Vec<(String, String)>>,
    last: Option<(u64, u64)>,
}

struct LogState {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: watch::Sender<u64>,
    failing_reads: AtomicUsize,
    clock: MemoryClock,
}

/// Append-only log held in process memory
///
/// Trimming is exact rather than approximate. Readers wake on every append.
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<LogState>,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            state: Arc::new(LogState {
                streams: Mutex::new(HashMap::new()),
                appended,
                failing_reads: AtomicUsize::new(0),
                clock: MemoryClock::new(),
            }),
        }
    }

    /// Make the next `count` reads fail, to exercise reconnect paths
    pub fn fail_next_reads(&self, count: usize) {
        self.state.failing_reads.store(count, Ordering::SeqCst);
    }

    fn next_id(stream: &StreamState, now: u64) -> (u64, u64) {
        match stream.last {
            Some((ms, seq)) if ms >= now => (ms, seq + 1),
            _ => (now, 0),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn format_id((ms, seq): (u64, u64)) -> String {
    format!("{ms}-{seq}")
}

/// XRANGE bound; a bare `<ms>` covers the whole millisecond, so it reads as
/// `<ms>-0` for a start and `<ms>-<max>` for an end
fn parse_bound(id: &str, is_end: bool) -> Result<(u64, u64)> {
    let invalid = || Error::InvalidInput(format!("invalid stream id: {id}"));
    match id {
        "-" => Ok((0, 0)),
        "+" => Ok((u64::MAX, u64::MAX)),
        _ if id.is_empty() && is_end => Ok((u64::MAX, u64::MAX)),
        _ if id.is_empty() => Ok((0, 0)),
        _ if !id.contains('-') && is_end => {
            let ms = id.parse().map_err(|_| invalid())?;
            Ok((ms, u64::MAX))
        }
        _ => parse_stream_id(id).ok_or_else(invalid),
    }
}

fn to_raw(id: (u64, u64), fields: &[(String, String)]) -> RawEntry {
    RawEntry {
        id: format_id(id),
        fields: fields.to_vec(),
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let now = u64::try_from(self.state.clock.now_millis()).unwrap_or_default();
        let id = {
            let mut streams = self.state.streams.lock();
            let entry = streams.entry(stream.to_string()).or_default();
            let id = Self::next_id(entry, now);
            entry.entries.insert(id, fields.to_vec());
            entry.last = Some(id);
            if let Some(max_len) = max_len {
                while entry.entries.len() > max_len {
                    entry.entries.pop_first();
                }
            }
            id
        };
        self.state.appended.send_modify(|n| *n += 1);
        Ok(format_id(id))
    }

    async fn range(&self, stream: &str, start: &str, end: &str) -> Result<Vec<RawEntry>> {
        let start = parse_bound(start, false)?;
        let end = parse_bound(end, true)?;
        if start > end {
            return Ok(Vec::new());
        }
        let streams = self.state.streams.lock();
        Ok(streams.get(stream).map_or_else(Vec::new, |s| {
            s.entries
                .range(start..=end)
                .map(|(id, fields)| to_raw(*id, fields))
                .collect()
        }))
    }

    async fn last_id(&self, stream: &str) -> Result<Option<String>> {
        let streams = self.state.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|s| s.entries.last_key_value())
            .map(|(id, _)| format_id(*id)))
    }

    async fn info(&self, stream: &str) -> Result<Option<StreamInfo>> {
        let streams = self.state.streams.lock();
        let Some(s) = streams.get(stream) else {
            return Ok(None);
        };
        let (Some((first, _)), Some((last, _))) = (s.entries.first_key_value(), s.entries.last_key_value()) else {
            return Ok(None);
        };
        Ok(Some(StreamInfo::from_bounds(
            format_id(*first),
            format_id(*last),
            s.entries.len(),
        )))
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>> {
        Ok(Box::new(MemoryLogReader {
            state: Arc::clone(&self.state),
            appended: self.state.appended.subscribe(),
            closed: false,
        }))
    }
}

struct MemoryLogReader {
    state: Arc<LogState>,
    appended: watch::Receiver<u64>,
    closed: bool,
}

impl MemoryLogReader {
    fn collect(&self, stream: &str, after: (u64, u64), count: usize) -> Vec<RawEntry> {
        let streams = self.state.streams.lock();
        streams.get(stream).map_or_else(Vec::new, |s| {
            s.entries
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(count)
                .map(|(id, fields)| to_raw(*id, fields))
                .collect()
        })
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read(
        &mut self,
        stream: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        if self.closed {
            return Err(Error::NotRunning("reader closed".to_string()));
        }
        let injected = self
            .state
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::Store("connection reset by peer".to_string()));
        }

        let after = parse_stream_id(after)
            .ok_or_else(|| Error::InvalidInput(format!("invalid stream id: {after}")))?;
        let deadline = Instant::now() + block;
        loop {
            self.appended.borrow_and_update();
            let entries = self.collect(stream, after, count);
            if !entries.is_empty() {
                return Ok(entries);
            }
            match tokio::time::timeout_at(deadline, self.appended.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire_with_clock() {
        let store = MemoryStore::new();
        store.set_ex("session-1", "{}", 10).await.unwrap();
        assert_eq!(store.ttl("session-1").await.unwrap(), 10);

        tokio::time::advance(Duration::from_secs(4)).await;
        let (_, ttl) = store.get_with_ttl("session-1").await.unwrap().unwrap();
        assert_eq!(ttl, 6);

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(store.get("session-1").await.unwrap().is_none());
        assert_eq!(store.ttl("session-1").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_sorted_add_prunes_old_scores() {
        let store = MemoryStore::new();
        store.sorted_add("list", &["a".to_string()], 100, 0).await.unwrap();
        store.sorted_add("list", &["b".to_string()], 200, 150).await.unwrap();
        assert_eq!(store.sorted_members("list").await.unwrap(), vec!["b".to_string()]);

        store.sorted_remove("list", "b").await.unwrap();
        assert!(store.sorted_members("list").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_all_or_nothing() {
        let store = MemoryStore::new();
        let first = vec!["{locks}:a".to_string(), "{locks}:b".to_string()];
        let second = vec!["{locks}:b".to_string(), "{locks}:c".to_string()];
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire(&first, "t1", ttl).await.unwrap());
        assert!(!store.try_acquire(&second, "t2", ttl).await.unwrap());
        // Nothing from the refused lease was written
        assert!(store.get("{locks}:c").await.unwrap().is_none());

        assert!(!store.extend(&first, "t2", ttl).await.unwrap());
        assert!(store.extend(&first, "t1", ttl).await.unwrap());
        assert!(store.release(&first, "t1").await.unwrap());
        assert!(store.try_acquire(&second, "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_ready_store_rejects_lock_calls() {
        let store = MemoryStore::new();
        store.set_ready(false);
        assert!(!store.is_ready());
        assert!(store
            .try_acquire(&["k".to_string()], "t", Duration::from_secs(1))
            .await
            .is_err());
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_hash_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_incr("w", "n", 2).await.unwrap(), 2);
        assert_eq!(store.hash_incr("w", "n", 3).await.unwrap(), 5);
        store
            .hash_set("w", &[("last".to_string(), "now".to_string())])
            .await
            .unwrap();
        let all = store.hash_get_all("w").await.unwrap();
        assert_eq!(all.get("n").map(String::as_str), Some("5"));
        assert!(store.del("w").await.unwrap());
        assert!(store.hash_get_all("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_ids_increase_and_trim() {
        let log = MemoryLog::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let value = i.to_string();
            ids.push(log.append("s", &fields(&[("n", &value)]), Some(3)).await.unwrap());
        }
        let parsed: Vec<_> = ids.iter().map(|id| parse_stream_id(id).unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));

        let all = log.range("s", "-", "+").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].field("n"), Some("2"));

        let info = log.info("s").await.unwrap().unwrap();
        assert_eq!(info.stream_size, 3);
        assert_eq!(info.last_event_id, ids[4]);
        assert!(log.info("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bare_millisecond_end_bound_covers_every_sequence() {
        let log = MemoryLog::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let value = i.to_string();
            ids.push(log.append("s", &fields(&[("n", &value)]), None).await.unwrap());
        }
        let (ms, last_seq) = parse_stream_id(&ids[2]).unwrap();
        assert_eq!(parse_stream_id(&ids[0]).unwrap().0, ms);
        assert!(last_seq > 0);

        let bare = ms.to_string();
        let within = log.range("s", &bare, &bare).await.unwrap();
        assert_eq!(within.len(), 3);
        assert_eq!(log.range("s", "-", &bare).await.unwrap().len(), 3);
        assert_eq!(log.range("s", &format!("{ms}-1"), "+").await.unwrap().len(), 2);
        assert!(log.range("s", "-", "x-1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_blocks_until_append() {
        let log = MemoryLog::new();
        let mut reader = log.open_reader().await.unwrap();

        let empty = reader.read("s", "0-0", 10, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", &fields(&[("k", "v")]), None).await.unwrap();
        });
        let entries = reader.read("s", "0-0", 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let log = MemoryLog::new();
        let mut reader = log.open_reader().await.unwrap();
        log.fail_next_reads(1);
        assert!(reader.read("s", "0-0", 10, Duration::ZERO).await.is_err());
        assert!(reader.read("s", "0-0", 10, Duration::ZERO).await.is_ok());

        reader.close().await;
        assert!(matches!(
            reader.read("s", "0-0", 10, Duration::ZERO).await,
            Err(Error::NotRunning(_))
        ));
    }
}
