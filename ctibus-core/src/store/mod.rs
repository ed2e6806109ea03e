//! Storage backends behind the coordination layer
//!
//! Three seams, each with a Redis implementation and an in-memory one used in
//! local-only mode and tests:
//! - [`KeyValueStore`]: expiring strings, sorted-set indexes, hashes
//! - [`LockStore`]: token-guarded multi-key leases
//! - [`EventLog`]: append-only streams with blocking readers

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

pub use self::memory::{MemoryLog, MemoryStore};
pub use self::redis::RedisStore;

/// Expiring key/value operations plus the sorted-set index used by the
/// ephemeral registries
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Wall clock used for index scores, in epoch milliseconds
    fn now_millis(&self) -> i64;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Value and its remaining ttl in seconds, fetched in one round trip
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, i64)>>;

    /// Remaining ttl in seconds; -2 when missing, -1 when persistent
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// `ZADD` every member at `score` and drop entries scored below
    /// `prune_before`, atomically
    async fn sorted_add(
        &self,
        list: &str,
        members: &[String],
        score: i64,
        prune_before: i64,
    ) -> Result<()>;

    async fn sorted_prune(&self, list: &str, prune_before: i64) -> Result<()>;

    /// Members in ascending score order
    async fn sorted_members(&self, list: &str) -> Result<Vec<String>>;

    async fn sorted_remove(&self, list: &str, member: &str) -> Result<()>;

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn ping(&self) -> Result<()>;

    async fn server_version(&self) -> Result<String>;
}

/// One lock replica. All keys of a lease are granted or refused together.
#[async_trait]
pub trait LockStore: Send + Sync {
    fn name(&self) -> &str;

    /// False once the underlying connection was shut down
    fn is_ready(&self) -> bool;

    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool>;

    /// Refresh the ttl only if every key still carries `token`
    async fn extend(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool>;

    /// Delete the keys still carrying `token`
    async fn release(&self, keys: &[String], token: &str) -> Result<bool>;
}

/// A stream entry as stored: server id plus flat field/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl RawEntry {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub first_event_id: String,
    pub last_event_id: String,
    pub first_event_date: DateTime<Utc>,
    pub last_event_date: DateTime<Utc>,
    pub stream_size: usize,
}

impl StreamInfo {
    /// Build from the first/last ids; dates come from the ms part of the ids
    #[must_use]
    pub fn from_bounds(first_event_id: String, last_event_id: String, stream_size: usize) -> Self {
        Self {
            first_event_date: stream_id_date(&first_event_id),
            last_event_date: stream_id_date(&last_event_id),
            first_event_id,
            last_event_id,
            stream_size,
        }
    }
}

/// Append-only stream storage
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append and return the assigned id; `max_len` requests approximate trimming
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String>;

    /// Inclusive range, `-` and `+` meaning the stream bounds
    async fn range(&self, stream: &str, start: &str, end: &str) -> Result<Vec<RawEntry>>;

    async fn last_id(&self, stream: &str) -> Result<Option<String>>;

    async fn info(&self, stream: &str) -> Result<Option<StreamInfo>>;

    /// Open a dedicated reader; blocking reads must not stall other commands
    async fn open_reader(&self) -> Result<Box<dyn LogReader>>;
}

#[async_trait]
pub trait LogReader: Send {
    /// Entries strictly after `after`, waiting up to `block` when none exist
    async fn read(
        &mut self,
        stream: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>>;

    async fn close(&mut self);
}

/// Parse a `<ms>-<seq>` stream id. A bare `<ms>` means sequence 0.
#[must_use]
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

fn stream_id_date(id: &str) -> DateTime<Utc> {
    parse_stream_id(id)
        .and_then(|(ms, _)| i64::try_from(ms).ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_default()
}
