//! Stream event model
//!
//! Events are built as [`StreamEvent`] values whose [`EventKind`] carries the
//! type-specific context. The flat JSON shape written to the stream is
//! [`WireEvent`]; the two convert into each other here and nowhere else.

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::origin::EventOrigin;
use crate::{Error, Result};

pub const EVENT_CURRENT_VERSION: &str = "4";
pub const EVENT_ACTIVITY_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventScope {
    #[default]
    External,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Merge,
    Delete,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Merge => "merge",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit message attached to an update by the author
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_references: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchContext {
    pub patch: Patch,
    pub reverse_patch: Patch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeContext {
    pub patch: Patch,
    pub reverse_patch: Patch,
    /// Wire payloads of the absorbed entities
    pub sources: Vec<Value>,
    /// Wire payloads of dependent objects removed by the merge
    pub deletions: Vec<Value>,
    /// Ids of relations re-pointed to the merge target
    pub shifts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteContext {
    pub deletions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Create,
    Update {
        commit: Option<Commit>,
        context: PatchContext,
    },
    Merge(MergeContext),
    Delete(DeleteContext),
}

/// An immutable change record
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub version: String,
    pub scope: EventScope,
    pub message: String,
    pub origin: EventOrigin,
    pub data: Value,
    pub kind: EventKind,
}

impl StreamEvent {
    #[must_use]
    pub fn new(kind: EventKind, message: impl Into<String>, origin: EventOrigin, data: Value) -> Self {
        Self {
            version: EVENT_CURRENT_VERSION.to_string(),
            scope: EventScope::External,
            message: message.into(),
            origin,
            data,
            kind,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: EventScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::Create => EventType::Create,
            EventKind::Update { .. } => EventType::Update,
            EventKind::Merge(_) => EventType::Merge,
            EventKind::Delete(_) => EventType::Delete,
        }
    }

    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self.scope, EventScope::Internal)
    }

    /// Forward patch for update and merge events
    #[must_use]
    pub const fn patch(&self) -> Option<&Patch> {
        match &self.kind {
            EventKind::Update { context, .. } => Some(&context.patch),
            EventKind::Merge(context) => Some(&context.patch),
            EventKind::Create | EventKind::Delete(_) => None,
        }
    }

    #[must_use]
    pub const fn reverse_patch(&self) -> Option<&Patch> {
        match &self.kind {
            EventKind::Update { context, .. } => Some(&context.reverse_patch),
            EventKind::Merge(context) => Some(&context.reverse_patch),
            EventKind::Create | EventKind::Delete(_) => None,
        }
    }

    /// Flatten into the wire shape
    pub fn to_wire(&self) -> Result<WireEvent> {
        let (commit, context) = match &self.kind {
            EventKind::Create => (None, None),
            EventKind::Update { commit, context } => (commit.clone(), Some(serde_json::to_value(context)?)),
            EventKind::Merge(context) => (None, Some(serde_json::to_value(context)?)),
            EventKind::Delete(context) => (None, Some(serde_json::to_value(context)?)),
        };
        Ok(WireEvent {
            version: self.version.clone(),
            event_type: self.event_type(),
            scope: self.scope,
            message: self.message.clone(),
            origin: self.origin.clone(),
            data: self.data.clone(),
            commit,
            context,
        })
    }
}

/// The flat event as stored: every top-level field becomes one stream field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub scope: EventScope,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub origin: EventOrigin,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl TryFrom<WireEvent> for StreamEvent {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self> {
        let context = |name: &str| {
            wire.context
                .clone()
                .ok_or_else(|| Error::InvalidInput(format!("{name} event without context")))
        };
        let kind = match wire.event_type {
            EventType::Create => EventKind::Create,
            EventType::Update => EventKind::Update {
                commit: wire.commit.clone(),
                context: serde_json::from_value(context("update")?)?,
            },
            EventType::Merge => EventKind::Merge(serde_json::from_value(context("merge")?)?),
            EventType::Delete => EventKind::Delete(serde_json::from_value(context("delete")?)?),
        };
        Ok(Self {
            version: wire.version,
            scope: wire.scope,
            message: wire.message,
            origin: wire.origin,
            data: wire.data,
            kind,
        })
    }
}

impl TryFrom<&StreamEvent> for WireEvent {
    type Error = Error;

    fn try_from(event: &StreamEvent) -> Result<Self> {
        event.to_wire()
    }
}

/// A decoded stream entry as handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseEvent<T = Value> {
    pub id: String,
    /// The entry's `type` field
    pub event: String,
    pub data: T,
}
