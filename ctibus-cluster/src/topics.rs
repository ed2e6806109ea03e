//! Bus topic names per entity type
//!
//! `Stix-Domain-Object` becomes `STIX_DOMAIN_OBJECT_EDIT_TOPIC` and so on.

fn topic(entity_type: &str, suffix: &str) -> String {
    let prefix: String = entity_type
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    format!("{prefix}_{suffix}")
}

#[must_use]
pub fn edit_topic(entity_type: &str) -> String {
    topic(entity_type, "EDIT_TOPIC")
}

#[must_use]
pub fn added_topic(entity_type: &str) -> String {
    topic(entity_type, "ADDED_TOPIC")
}

#[must_use]
pub fn delete_topic(entity_type: &str) -> String {
    topic(entity_type, "DELETE_TOPIC")
}

/// Edit-context changes (who is editing what)
#[must_use]
pub fn context_topic(entity_type: &str) -> String {
    topic(entity_type, "CONTEXT_TOPIC")
}
