//! Redlead Error Types

use thiserror::Error;

/// Result type alias for redlead operations
pub type Result<T> = std::result::Result<T, Error>;

/// Redlead error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required flags: {0}")]
    MissingConfig(String),

    // Kubernetes API errors
    #[error("Kubernetes API error: {0}")]
    Kubernetes(#[from] kube::Error),

    // Store control errors
    #[error("Store control error: {0}")]
    Store(#[from] redis::RedisError),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    // Relay errors
    #[error("Relay error: {0}")]
    Relay(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Coordination aborted by fatal failure")]
    Aborted,
}
