use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A requested resource was deleted inside the lock race window
    #[error("Resource already deleted: {}", .ids.join(", "))]
    AlreadyDeleted { ids: Vec<String> },

    /// The lease could not be obtained before retries ran out
    #[error("Lock timeout on {} after {attempts} attempt(s)", .resources.join(", "))]
    LockTimeout {
        resources: Vec<String>,
        attempts: u32,
    },

    /// Extension refused: the lease expired or changed owner
    #[error("Lock lost on {}", .resources.join(", "))]
    LeaseLost { resources: Vec<String> },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not running: {0}")]
    NotRunning(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Coordination failures: the caller must abort its mutation
    #[must_use]
    pub const fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyDeleted { .. } | Self::LockTimeout { .. } | Self::LeaseLost { .. }
        )
    }

    /// I/O failures that a retry loop may recover from
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Store(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
