use serde::{Deserialize, Serialize};

/// Where a mutation came from, copied verbatim into every event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOrigin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applicant_id: Option<String>,
}

/// The authenticated caller performing a mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub origin: EventOrigin,
}

impl Actor {
    pub fn new(id: impl Into<String>, user_email: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            origin: EventOrigin {
                user_id: Some(id.clone()),
                ..EventOrigin::default()
            },
            id,
            name: String::new(),
            user_email: user_email.into(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }
}
