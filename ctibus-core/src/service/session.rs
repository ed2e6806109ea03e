//! User sessions stored as ephemeral registry entries

use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use super::registry::{EphemeralRegistry, RegistryEntry};
use crate::{KeyBuilder, Result, StoreContext};

#[derive(Clone, Debug)]
pub struct SessionService {
    registry: EphemeralRegistry,
    keys: KeyBuilder,
}

impl SessionService {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            registry: EphemeralRegistry::new(ctx.store()),
            keys: ctx.keys().clone(),
        }
    }

    /// Session value with its remaining ttl under `expiration`
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Value>> {
        let key = self.keys.session(session_id);
        Ok(self.registry.get(&key).await?.map(|(mut value, ttl)| {
            if let Value::Object(map) = &mut value {
                map.insert("expiration".to_string(), Value::from(ttl));
            }
            value
        }))
    }

    pub async fn set_session(&self, session_id: &str, value: &Value, ttl_secs: u64) -> Result<()> {
        let key = self.keys.session(session_id);
        self.registry
            .set_key_with_list(&key, &[self.keys.sessions()], value, ttl_secs)
            .await
    }

    /// Remove the session and return what it held
    pub async fn kill_session(&self, session_id: &str) -> Result<Option<Value>> {
        let current = self.get_session(session_id).await?;
        let key = self.keys.session(session_id);
        self.registry
            .del_key_with_list(&key, &[self.keys.sessions()])
            .await?;
        debug!(session_id = %session_id, existed = current.is_some(), "Session killed");
        Ok(current)
    }

    /// Every indexed session key, live or not
    pub async fn session_keys(&self) -> Result<Vec<String>> {
        self.registry.members(&self.keys.sessions()).await
    }

    pub async fn sessions(&self) -> Result<Vec<RegistryEntry>> {
        self.registry.keys_from_list(&self.keys.sessions(), None).await
    }

    /// Push the expiry out by `extension_secs`; false when the session is gone
    pub async fn extend_session(&self, session_id: &str, extension_secs: u64) -> Result<bool> {
        let key = self.keys.session(session_id);
        let sessions = self.keys.sessions();
        let (extended, ()) = futures::try_join!(
            self.registry.expire(&key, extension_secs),
            self.registry.refresh_in_list(&sessions, &key, extension_secs),
        )?;
        Ok(extended)
    }

    /// Delete every indexed session value and the index itself; returns how
    /// many values still existed
    pub async fn clear_sessions(&self) -> Result<usize> {
        let keys = self.session_keys().await?;
        let removed = try_join_all(keys.iter().map(|key| self.registry.del(key))).await?;
        self.registry.del(&self.keys.sessions()).await?;
        Ok(removed.into_iter().filter(|r| *r).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::memory_context;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let sessions = SessionService::new(&memory_context());
        sessions
            .set_session("sess:abc", &json!({ "user_id": "u1" }), 1200)
            .await
            .unwrap();

        let session = sessions.get_session("sess:abc").await.unwrap().unwrap();
        assert_eq!(session["user_id"], "u1");
        assert_eq!(session["expiration"], 1200);
        assert_eq!(sessions.session_keys().await.unwrap(), vec!["sess:abc".to_string()]);
        assert_eq!(sessions.sessions().await.unwrap().len(), 1);

        let killed = sessions.kill_session("sess:abc").await.unwrap().unwrap();
        assert_eq!(killed["user_id"], "u1");
        assert!(sessions.get_session("sess:abc").await.unwrap().is_none());
        assert!(sessions.session_keys().await.unwrap().is_empty());
        assert!(sessions.kill_session("sess:abc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_session() {
        let sessions = SessionService::new(&memory_context());
        sessions.set_session("s1", &json!({}), 10).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(sessions.extend_session("s1", 60).await.unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        let session = sessions.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session["expiration"], 30);

        assert!(!sessions.extend_session("missing", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_sessions() {
        let sessions = SessionService::new(&memory_context());
        for id in ["a", "b", "c"] {
            sessions.set_session(id, &json!({ "id": id }), 600).await.unwrap();
        }
        assert_eq!(sessions.clear_sessions().await.unwrap(), 3);
        assert!(sessions.sessions().await.unwrap().is_empty());
        assert!(sessions.session_keys().await.unwrap().is_empty());
    }
}
