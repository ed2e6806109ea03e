//! Unified Redis key builder
//!
//! Every key other processes may read directly (connectors, other platform
//! nodes) is built here so the naming contract lives in one place. An optional
//! namespace isolates tenants/environments sharing one Redis.

use crate::Config;

pub const SESSIONS_LIST: &str = "platform_sessions";
pub const CLUSTER_LIST: &str = "platform_cluster";
pub const DELETIONS_LIST: &str = "platform-deletions";

#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a builder; an empty namespace produces bare keys
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let prefix = if namespace.is_empty() {
            namespace
        } else {
            format!("{namespace}:")
        };
        Self { prefix }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.redis.namespace.clone())
    }

    /// Apply the namespace to an arbitrary key
    #[must_use]
    pub fn key(&self, raw: &str) -> String {
        format!("{}{raw}", self.prefix)
    }

    // ==================== Locking ====================

    /// Lock key for one resource id
    ///
    /// Type: String + PX (lease token)
    /// The `{locks}` hash tag keeps every lock key on one cluster slot so a
    /// multi-resource lease can be set atomically.
    #[must_use]
    pub fn lock(&self, resource_id: &str) -> String {
        format!("{}{{locks}}:{resource_id}", self.prefix)
    }

    /// Recently deleted ids
    ///
    /// Type: Sorted Set, score = deletion time (ms)
    #[must_use]
    pub fn deletions(&self) -> String {
        self.key(DELETIONS_LIST)
    }

    // ==================== Ephemeral registries ====================

    /// Type: Sorted Set, member = session key, score = last refresh (ms)
    #[must_use]
    pub fn sessions(&self) -> String {
        self.key(SESSIONS_LIST)
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        self.key(session_id)
    }

    /// Type: Sorted Set, member = node key, score = last heartbeat (ms)
    #[must_use]
    pub fn cluster(&self) -> String {
        self.key(CLUSTER_LIST)
    }

    #[must_use]
    pub fn cluster_node(&self, node_id: &str) -> String {
        self.key(node_id)
    }

    /// Who is editing this instance
    #[must_use]
    pub fn context_instance(&self, instance_id: &str) -> String {
        format!("{}context:instance:{instance_id}", self.prefix)
    }

    /// What this user is editing (reverse lookup for logout)
    #[must_use]
    pub fn context_user(&self, user_id: &str) -> String {
        format!("{}context:user:{user_id}", self.prefix)
    }

    /// Type: String + EX, value = edit context JSON
    #[must_use]
    pub fn edit_context(&self, instance_id: &str, user_id: &str) -> String {
        format!("{}edit:{instance_id}:{user_id}", self.prefix)
    }

    /// Instance id of an `edit:<instance>:<user>` key owned by `user_id`
    #[must_use]
    pub fn edit_context_instance<'a>(&self, key: &'a str, user_id: &str) -> Option<&'a str> {
        self.strip(key)?
            .strip_prefix("edit:")?
            .strip_suffix(user_id)?
            .strip_suffix(':')
    }

    // ==================== Playbook executions ====================

    /// Type: String + EX, value = merged execution envelope JSON
    #[must_use]
    pub fn playbook_execution(&self, execution_id: &str) -> String {
        format!("{}playbook_execution_{execution_id}", self.prefix)
    }

    /// Type: Sorted Set, member = execution key, score = last update (ms)
    #[must_use]
    pub fn playbook_executions(&self, playbook_id: &str) -> String {
        format!("{}playbook_executions_{playbook_id}", self.prefix)
    }

    // ==================== Work tracking ====================

    /// Type: Hash, fields = import counters
    #[must_use]
    pub fn work(&self, work_id: &str) -> String {
        self.key(work_id)
    }

    /// Type: String, value = latest work id of the connector
    #[must_use]
    pub fn connector_work(&self, connector_id: &str) -> String {
        format!("{}work:{connector_id}", self.prefix)
    }

    // ==================== Streams & topics ====================

    #[must_use]
    pub fn stream(&self, name: &str) -> String {
        self.key(name)
    }

    #[must_use]
    pub fn topic(&self, topic: &str) -> String {
        self.key(topic)
    }

    /// Strip the namespace from a channel name received from Redis
    #[must_use]
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_keys_keep_external_contract() {
        let keys = KeyBuilder::new("");
        assert_eq!(keys.sessions(), "platform_sessions");
        assert_eq!(keys.cluster(), "platform_cluster");
        assert_eq!(keys.deletions(), "platform-deletions");
        assert_eq!(keys.context_instance("abc"), "context:instance:abc");
        assert_eq!(keys.context_user("u1"), "context:user:u1");
        assert_eq!(keys.edit_context("abc", "u1"), "edit:abc:u1");
        assert_eq!(keys.lock("report-7"), "{locks}:report-7");
        assert_eq!(keys.connector_work("c1"), "work:c1");
        assert_eq!(keys.playbook_execution("e1"), "playbook_execution_e1");
        assert_eq!(keys.playbook_executions("pb1"), "playbook_executions_pb1");
    }

    #[test]
    fn test_edit_context_instance_roundtrip() {
        let keys = KeyBuilder::new("tenant-a");
        let key = keys.edit_context("report:7", "u1");
        assert_eq!(keys.edit_context_instance(&key, "u1"), Some("report:7"));
        assert_eq!(keys.edit_context_instance(&key, "u2"), None);
        assert_eq!(keys.edit_context_instance("edit:report-7:u1", "u1"), None);
    }

    #[test]
    fn test_namespace_prefix() {
        let keys = KeyBuilder::new("tenant-a");
        assert_eq!(keys.sessions(), "tenant-a:platform_sessions");
        assert_eq!(keys.lock("x"), "tenant-a:{locks}:x");
        assert_eq!(keys.stream("stream.platform"), "tenant-a:stream.platform");
        assert_eq!(keys.strip("tenant-a:Indicator_EDIT_TOPIC"), Some("Indicator_EDIT_TOPIC"));
        assert_eq!(keys.strip("other:topic"), None);
    }
}
