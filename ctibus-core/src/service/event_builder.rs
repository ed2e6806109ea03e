//! Build stream events from object snapshots
//!
//! Snapshots are converted to their wire payload by a [`StixConverter`]
//! before diffing. Objects the converter does not export never produce an
//! event.

use serde_json::Value;
use std::sync::Arc;

use crate::models::{
    Actor, Commit, DeleteContext, EventKind, MergeContext, PatchContext, StreamEvent,
};
use crate::{Error, Result};

/// Converts stored objects to their wire payload
pub trait StixConverter: Send + Sync {
    fn convert(&self, instance: &Value) -> Value;

    /// Whether changes to this object belong on the stream at all
    fn is_exportable(&self, instance: &Value) -> bool;
}

/// Entity types that stay platform-internal
pub const INTERNAL_ENTITY_TYPES: &[&str] = &[
    "Settings",
    "User",
    "Group",
    "Role",
    "Capability",
    "Connector",
    "Work",
    "Workspace",
    "Notification",
];

/// Pass-through converter for objects that are already JSON payloads
///
/// Drops fields prefixed with `i_` (denormalized indexing helpers) and treats
/// every object with an `id` and a non-internal `entity_type` as exportable.
#[derive(Debug, Clone)]
pub struct JsonConverter {
    internal_types: Vec<String>,
}

impl JsonConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_internal_types(INTERNAL_ENTITY_TYPES.iter().map(|t| (*t).to_string()))
    }

    pub fn with_internal_types(types: impl IntoIterator<Item = String>) -> Self {
        Self {
            internal_types: types.into_iter().collect(),
        }
    }
}

impl Default for JsonConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl StixConverter for JsonConverter {
    fn convert(&self, instance: &Value) -> Value {
        match instance {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !k.starts_with("i_"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn is_exportable(&self, instance: &Value) -> bool {
        let has_id = instance.get("id").and_then(Value::as_str).is_some();
        let internal = instance
            .get("entity_type")
            .and_then(Value::as_str)
            .is_some_and(|t| self.internal_types.iter().any(|i| i == t));
        has_id && !internal
    }
}

/// Side effects of a merge that consumers need to replay it
#[derive(Debug, Clone, Default)]
pub struct MergeImpacts {
    /// Relations re-pointed to the merge target
    pub updated_relations: Vec<String>,
    /// Objects deleted because they depended on a source
    pub dependency_deletions: Vec<Value>,
}

fn is_modified_touch(patch: &json_patch::Patch) -> Result<bool> {
    if patch.0.len() != 1 {
        return Ok(false);
    }
    let op = serde_json::to_value(&patch.0[0])?;
    Ok(op.get("path").and_then(Value::as_str) == Some("/modified"))
}

/// Build an update event from two wire payloads
///
/// Fails with `Unsupported` when nothing changed or when the only change is
/// the `modified` timestamp.
pub fn build_update_event(
    actor: &Actor,
    previous: &Value,
    current: &Value,
    message: &str,
    commit: Option<Commit>,
) -> Result<StreamEvent> {
    let patch = json_patch::diff(previous, current);
    let reverse_patch = json_patch::diff(current, previous);
    if patch.0.is_empty() || reverse_patch.0.is_empty() {
        return Err(Error::Unsupported(
            "Update event must contain a valid previous patch".to_string(),
        ));
    }
    if is_modified_touch(&patch)? {
        return Err(Error::Unsupported(
            "Update event must contain more operations than just the modified timestamp".to_string(),
        ));
    }
    Ok(StreamEvent::new(
        EventKind::Update {
            commit,
            context: PatchContext {
                patch,
                reverse_patch,
            },
        },
        message,
        actor.origin.clone(),
        current.clone(),
    ))
}

#[derive(Clone)]
pub struct EventBuilder {
    converter: Arc<dyn StixConverter>,
}

impl std::fmt::Debug for EventBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuilder").finish_non_exhaustive()
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new(Arc::new(JsonConverter::new()))
    }
}

impl EventBuilder {
    #[must_use]
    pub fn new(converter: Arc<dyn StixConverter>) -> Self {
        Self { converter }
    }

    #[must_use]
    pub fn converter(&self) -> &dyn StixConverter {
        self.converter.as_ref()
    }

    pub fn create_event(&self, actor: &Actor, instance: &Value, message: &str) -> Option<StreamEvent> {
        if !self.converter.is_exportable(instance) {
            return None;
        }
        Some(StreamEvent::new(
            EventKind::Create,
            message,
            actor.origin.clone(),
            self.converter.convert(instance),
        ))
    }

    /// Create event for a relationship; `without_message` writes `-`
    pub fn create_relation_event(
        &self,
        actor: &Actor,
        instance: &Value,
        without_message: bool,
    ) -> Option<StreamEvent> {
        let message = if without_message {
            "-".to_string()
        } else {
            generate_create_message(instance)
        };
        self.create_event(actor, instance, &message)
    }

    pub fn update_event(
        &self,
        actor: &Actor,
        previous: &Value,
        instance: &Value,
        message: &str,
        commit: Option<Commit>,
    ) -> Result<Option<StreamEvent>> {
        if !self.converter.is_exportable(instance) {
            return Ok(None);
        }
        let previous = self.converter.convert(previous);
        let current = self.converter.convert(instance);
        build_update_event(actor, &previous, &current, message, commit).map(Some)
    }

    pub fn merge_event(
        &self,
        actor: &Actor,
        previous: &Value,
        merged: &Value,
        sources: &[Value],
        impacts: &MergeImpacts,
    ) -> Option<StreamEvent> {
        if !self.converter.is_exportable(merged) {
            return None;
        }
        let previous_wire = self.converter.convert(previous);
        let current_wire = self.converter.convert(merged);
        let context = MergeContext {
            patch: json_patch::diff(&previous_wire, &current_wire),
            reverse_patch: json_patch::diff(&current_wire, &previous_wire),
            sources: sources.iter().map(|s| self.converter.convert(s)).collect(),
            deletions: impacts
                .dependency_deletions
                .iter()
                .map(|d| self.converter.convert(d))
                .collect(),
            shifts: impacts.updated_relations.clone(),
        };
        Some(StreamEvent::new(
            EventKind::Merge(context),
            generate_merge_message(merged, sources),
            actor.origin.clone(),
            current_wire,
        ))
    }

    pub fn delete_event(
        &self,
        actor: &Actor,
        instance: &Value,
        message: &str,
        deletions: &[Value],
    ) -> Option<StreamEvent> {
        if !self.converter.is_exportable(instance) {
            return None;
        }
        let context = DeleteContext {
            deletions: deletions.iter().map(|d| self.converter.convert(d)).collect(),
        };
        Some(StreamEvent::new(
            EventKind::Delete(context),
            message,
            actor.origin.clone(),
            self.converter.convert(instance),
        ))
    }
}

fn entity_type(instance: &Value) -> &str {
    instance
        .get("entity_type")
        .or_else(|| instance.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("object")
}

/// Best human label of an object
fn representative(instance: &Value) -> &str {
    ["name", "value", "observable_value", "attribute_abstract", "id"]
        .iter()
        .find_map(|field| instance.get(*field).and_then(Value::as_str))
        .unwrap_or("unknown")
}

#[must_use]
pub fn generate_create_message(instance: &Value) -> String {
    match instance.get("relationship_type").and_then(Value::as_str) {
        Some(relationship) => {
            let from = instance.get("from").map_or("unknown", representative);
            let to = instance.get("to").map_or("unknown", representative);
            format!("creates the relation {relationship} from `{from}` to `{to}`")
        }
        None => format!("creates a {} `{}`", entity_type(instance), representative(instance)),
    }
}

#[must_use]
pub fn generate_delete_message(instance: &Value) -> String {
    match instance.get("relationship_type").and_then(Value::as_str) {
        Some(relationship) => {
            let from = instance.get("from").map_or("unknown", representative);
            let to = instance.get("to").map_or("unknown", representative);
            format!("deletes the relation {relationship} from `{from}` to `{to}`")
        }
        None => format!("deletes a {} `{}`", entity_type(instance), representative(instance)),
    }
}

#[must_use]
pub fn generate_merge_message(target: &Value, sources: &[Value]) -> String {
    let names: Vec<&str> = sources.iter().map(representative).collect();
    format!(
        "merges {} `{}` in `{}`",
        entity_type(target),
        names.join(", "),
        representative(target)
    )
}
