//! Recent playbook executions
//!
//! Each execution envelope is deep-merged into `playbook_execution_<id>` as the
//! playbook runs and indexed per playbook, so the UI can show the last runs
//! for five minutes.

use serde::Serialize;
use serde_json::{Map, Value};

use super::registry::{EphemeralRegistry, RegistryEntry};
use crate::{Error, KeyBuilder, Result, StoreContext};

pub const PLAYBOOK_EXECUTION_TTL_SECS: u64 = 5 * 60;

const STEP_PREFIX: &str = "step_";

/// One executed step, its recorded fields flattened alongside
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybookStep {
    pub id: String,
    /// Pretty JSON of `[bundle]`, or of `patch` when there is no bundle
    pub bundle_or_patch: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybookExecution {
    pub id: Option<String>,
    pub playbook_id: Option<String>,
    /// `in_timestamp` of the earliest step
    pub execution_start: Option<Value>,
    pub steps: Vec<PlaybookStep>,
}

#[derive(Clone, Debug)]
pub struct PlaybookExecutionService {
    registry: EphemeralRegistry,
    keys: KeyBuilder,
}

impl PlaybookExecutionService {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            registry: EphemeralRegistry::new(ctx.store()),
            keys: ctx.keys().clone(),
        }
    }

    /// Merge `envelope` over the stored execution and re-index it.
    /// Returns the merged envelope.
    pub async fn update_execution(&self, envelope: &Value) -> Result<Value> {
        let execution_id = required_str(envelope, "playbook_execution_id")?;
        let playbook_id = required_str(envelope, "playbook_id")?;

        let key = self.keys.playbook_execution(execution_id);
        let mut merged = match self.registry.get(&key).await? {
            Some((current @ Value::Object(_), _)) => current,
            _ => Value::Object(Map::new()),
        };
        merge_deep(&mut merged, envelope);

        self.registry
            .set_key_with_list(
                &key,
                &[self.keys.playbook_executions(playbook_id)],
                &merged,
                PLAYBOOK_EXECUTION_TTL_SECS,
            )
            .await?;
        Ok(merged)
    }

    /// Executions of the playbook updated within the last five minutes
    pub async fn last_executions(&self, playbook_id: &str) -> Result<Vec<PlaybookExecution>> {
        let entries = self
            .registry
            .keys_from_list(
                &self.keys.playbook_executions(playbook_id),
                Some(PLAYBOOK_EXECUTION_TTL_SECS),
            )
            .await?;
        Ok(entries.into_iter().map(to_execution).collect())
    }
}

fn required_str<'a>(envelope: &'a Value, field: &str) -> Result<&'a str> {
    envelope
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("execution envelope is missing {field}")))
}

/// Right-biased deep merge: objects merge key by key, anything else replaces
fn merge_deep(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(key) {
                    Some(existing) => merge_deep(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

fn to_execution(entry: RegistryEntry) -> PlaybookExecution {
    let mut steps: Vec<PlaybookStep> = entry
        .value
        .iter()
        .filter_map(|(key, value)| {
            let id = key.strip_prefix(STEP_PREFIX)?;
            Some(to_step(id, value))
        })
        .collect();
    steps.sort_by(|a, b| {
        timestamp(a)
            .cmp(&timestamp(b))
            .then_with(|| a.id.cmp(&b.id))
    });

    let field = |name: &str| entry.value.get(name).and_then(Value::as_str).map(str::to_string);
    PlaybookExecution {
        id: field("playbook_execution_id"),
        playbook_id: field("playbook_id"),
        execution_start: steps.first().and_then(|s| s.data.get("in_timestamp").cloned()),
        steps,
    }
}

fn timestamp(step: &PlaybookStep) -> Option<&str> {
    step.data.get("in_timestamp").and_then(Value::as_str)
}

fn to_step(id: &str, value: &Value) -> PlaybookStep {
    let mut data = match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let bundle_or_patch = match (data.get("bundle"), data.get("patch")) {
        (Some(bundle), _) if !bundle.is_null() => {
            serde_json::to_string_pretty(&[bundle]).ok()
        }
        (_, Some(patch)) => serde_json::to_string_pretty(patch).ok(),
        _ => None,
    };
    // Recorded fields win over the derived ones
    let id = match data.remove("id") {
        Some(Value::String(own)) => own,
        _ => id.to_string(),
    };
    let bundle_or_patch = match data.remove("bundle_or_patch") {
        Some(Value::String(own)) => Some(own),
        _ => bundle_or_patch,
    };
    PlaybookStep {
        id,
        bundle_or_patch,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::memory_context;
    use serde_json::json;
    use std::time::Duration;

    fn envelope(execution: &str, step: &str, step_data: Value) -> Value {
        let mut envelope = json!({
            "playbook_execution_id": execution,
            "playbook_id": "pb-1",
        });
        envelope[format!("step_{step}")] = step_data;
        envelope
    }

    #[tokio::test]
    async fn test_updates_merge_deeply() {
        let playbooks = PlaybookExecutionService::new(&memory_context());
        playbooks
            .update_execution(&envelope(
                "exec-1",
                "a",
                json!({ "in_timestamp": "2024-01-01T00:00:00Z", "status": "running" }),
            ))
            .await
            .unwrap();
        let merged = playbooks
            .update_execution(&envelope(
                "exec-1",
                "a",
                json!({ "out_timestamp": "2024-01-01T00:00:01Z", "status": "success" }),
            ))
            .await
            .unwrap();

        assert_eq!(merged["step_a"]["in_timestamp"], "2024-01-01T00:00:00Z");
        assert_eq!(merged["step_a"]["out_timestamp"], "2024-01-01T00:00:01Z");
        assert_eq!(merged["step_a"]["status"], "success");
    }

    #[tokio::test]
    async fn test_last_executions_reshapes_steps() {
        let playbooks = PlaybookExecutionService::new(&memory_context());
        playbooks
            .update_execution(&envelope(
                "exec-1",
                "b",
                json!({
                    "in_timestamp": "2024-01-01T00:00:02Z",
                    "patch": [{ "op": "add", "path": "/labels/0", "value": "apt" }],
                }),
            ))
            .await
            .unwrap();
        playbooks
            .update_execution(&envelope(
                "exec-1",
                "a",
                json!({
                    "in_timestamp": "2024-01-01T00:00:00Z",
                    "bundle": { "type": "bundle", "objects": [] },
                }),
            ))
            .await
            .unwrap();

        let executions = playbooks.last_executions("pb-1").await.unwrap();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.id.as_deref(), Some("exec-1"));
        assert_eq!(execution.playbook_id.as_deref(), Some("pb-1"));
        assert_eq!(execution.execution_start, Some(json!("2024-01-01T00:00:00Z")));

        let ids: Vec<&str> = execution.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let bundle: Value =
            serde_json::from_str(execution.steps[0].bundle_or_patch.as_deref().unwrap()).unwrap();
        assert_eq!(bundle, json!([{ "type": "bundle", "objects": [] }]));
        let patch: Value =
            serde_json::from_str(execution.steps[1].bundle_or_patch.as_deref().unwrap()).unwrap();
        assert_eq!(patch[0]["value"], "apt");

        assert!(playbooks.last_executions("pb-2").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executions_lapse_after_five_minutes() {
        let playbooks = PlaybookExecutionService::new(&memory_context());
        playbooks
            .update_execution(&envelope("exec-1", "a", json!({ "in_timestamp": "t0" })))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(PLAYBOOK_EXECUTION_TTL_SECS - 10)).await;
        assert_eq!(playbooks.last_executions("pb-1").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(playbooks.last_executions("pb-1").await.unwrap().is_empty());

        // A lapsed execution starts over instead of merging into stale state
        let fresh = playbooks
            .update_execution(&envelope("exec-1", "b", json!({ "in_timestamp": "t1" })))
            .await
            .unwrap();
        assert!(fresh.get("step_a").is_none());
    }

    #[tokio::test]
    async fn test_envelope_requires_ids() {
        let playbooks = PlaybookExecutionService::new(&memory_context());
        let result = playbooks.update_execution(&json!({ "playbook_id": "pb-1" })).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
