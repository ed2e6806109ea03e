//! Error types for the cluster crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid topic pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The bus was shut down or its publisher task exited
    #[error("Bus closed: {0}")]
    Closed(String),

    #[error(transparent)]
    Store(#[from] ctibus_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
