//! Who is currently editing what
//!
//! Each entry lives under `edit:<instance>:<user>` and is indexed twice: by
//! instance for display, by user for cleanup on logout.

use futures::future::try_join_all;
use serde_json::Value;

use super::registry::{EphemeralRegistry, RegistryEntry};
use crate::models::Actor;
use crate::{Error, KeyBuilder, Result, StoreContext};

pub const EDIT_CONTEXT_TTL_SECS: u64 = 5 * 60;

#[derive(Clone, Debug)]
pub struct EditContextService {
    registry: EphemeralRegistry,
    keys: KeyBuilder,
}

impl EditContextService {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            registry: EphemeralRegistry::new(ctx.store()),
            keys: ctx.keys().clone(),
        }
    }

    fn lists(&self, actor: &Actor, instance_id: &str) -> [String; 2] {
        [
            self.keys.context_instance(instance_id),
            self.keys.context_user(&actor.id),
        ]
    }

    /// Record the actor's edit context; `name` is set to the actor's email
    pub async fn set_edit_context(&self, actor: &Actor, instance_id: &str, input: &Value) -> Result<()> {
        let mut data = match input {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            _ => return Err(Error::InvalidInput("edit context must be an object".to_string())),
        };
        data.insert("name".to_string(), Value::from(actor.user_email.clone()));

        let key = self.keys.edit_context(instance_id, &actor.id);
        self.registry
            .set_key_with_list(
                &key,
                &self.lists(actor, instance_id),
                &Value::Object(data),
                EDIT_CONTEXT_TTL_SECS,
            )
            .await
    }

    pub async fn fetch_edit_context(&self, instance_id: &str) -> Result<Vec<RegistryEntry>> {
        self.registry
            .keys_from_list(&self.keys.context_instance(instance_id), Some(EDIT_CONTEXT_TTL_SECS))
            .await
    }

    pub async fn del_edit_context(&self, actor: &Actor, instance_id: &str) -> Result<()> {
        let key = self.keys.edit_context(instance_id, &actor.id);
        self.registry
            .del_key_with_list(&key, &self.lists(actor, instance_id))
            .await
    }

    /// Drop every edit context of the actor (logout), values and both indexes
    pub async fn del_user_context(&self, actor: &Actor) -> Result<()> {
        let user_list = self.keys.context_user(&actor.id);
        let keys = self.registry.members(&user_list).await?;
        try_join_all(keys.iter().map(|key| {
            let mut lists = vec![user_list.clone()];
            if let Some(instance_id) = self.keys.edit_context_instance(key, &actor.id) {
                lists.push(self.keys.context_instance(instance_id));
            }
            async move { self.registry.del_key_with_list(key, &lists).await }
        }))
        .await?;
        self.registry.del(&user_list).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{memory_context, test_actor};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_and_fetch_adds_name() {
        let contexts = EditContextService::new(&memory_context());
        let actor = test_actor();
        contexts
            .set_edit_context(&actor, "report-7", &json!({ "focusOn": "description" }))
            .await
            .unwrap();

        let entries = contexts.fetch_edit_context("report-7").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].redis_key_id, "edit:report-7:user-1");
        assert_eq!(entries[0].get("name"), Some(&json!("analyst@example.com")));
        assert_eq!(entries[0].get("focusOn"), Some(&json!("description")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contexts_lapse_after_five_minutes() {
        let contexts = EditContextService::new(&memory_context());
        let actor = test_actor();
        contexts.set_edit_context(&actor, "report-7", &json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(EDIT_CONTEXT_TTL_SECS + 1)).await;
        assert!(contexts.fetch_edit_context("report-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_list_is_empty() {
        let contexts = EditContextService::new(&memory_context());
        let actor = test_actor();
        contexts.set_edit_context(&actor, "report-7", &json!({})).await.unwrap();
        contexts.del_edit_context(&actor, "report-7").await.unwrap();
        assert!(contexts.fetch_edit_context("report-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_logout_clears_all_contexts() {
        let contexts = EditContextService::new(&memory_context());
        let actor = test_actor();
        for instance in ["report-7", "indicator-1"] {
            contexts.set_edit_context(&actor, instance, &json!({})).await.unwrap();
        }
        contexts.del_user_context(&actor).await.unwrap();
        assert!(contexts.fetch_edit_context("report-7").await.unwrap().is_empty());
        assert!(contexts.fetch_edit_context("indicator-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_logout_empties_indexes() {
        let ctx = memory_context();
        let contexts = EditContextService::new(&ctx);
        let registry = EphemeralRegistry::new(ctx.store());
        let actor = test_actor();
        let other = Actor::new("user-2", "lead@example.com");
        contexts.set_edit_context(&actor, "report-7", &json!({})).await.unwrap();
        contexts.set_edit_context(&other, "report-7", &json!({})).await.unwrap();

        contexts.del_user_context(&actor).await.unwrap();

        let keys = ctx.keys();
        assert!(registry.members(&keys.context_user("user-1")).await.unwrap().is_empty());
        assert_eq!(
            registry.members(&keys.context_instance("report-7")).await.unwrap(),
            vec!["edit:report-7:user-2".to_string()]
        );
        let remaining = contexts.fetch_edit_context("report-7").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("name"), Some(&json!("lead@example.com")));
    }

    #[tokio::test]
    async fn test_non_object_input_rejected() {
        let contexts = EditContextService::new(&memory_context());
        let result = contexts.set_edit_context(&test_actor(), "x", &json!("text")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
