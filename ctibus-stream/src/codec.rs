//! Stream entry encoding
//!
//! Each top-level field of an event becomes one stream field whose value is
//! the field's JSON encoding. Decoding parses every field back and exposes
//! the `type` field as the event name.

use ctibus_core::models::SseEvent;
use ctibus_core::store::RawEntry;
use ctibus_core::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// Flatten a serializable object into field/value pairs; null fields are skipped
pub fn encode_fields<T: Serialize>(event: &T) -> Result<Vec<(String, String)>> {
    let Value::Object(map) = serde_json::to_value(event)? else {
        return Err(Error::InvalidInput("stream events must serialize to an object".to_string()));
    };
    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(field, value)| Ok((field, serde_json::to_string(&value)?)))
        .collect()
}

pub fn decode_entry(entry: &RawEntry) -> Result<SseEvent> {
    let mut data = Map::with_capacity(entry.fields.len());
    for (field, raw) in &entry.fields {
        data.insert(field.clone(), serde_json::from_str(raw)?);
    }
    let event = data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(SseEvent {
        id: entry.id.clone(),
        event,
        data: Value::Object(data),
    })
}

/// Events without a scope count as external
#[must_use]
pub fn is_external(event: &SseEvent) -> bool {
    event
        .data
        .get("scope")
        .and_then(Value::as_str)
        .is_none_or(|scope| scope == "external")
}
