//! Error types for the backing stores.

/// Errors that can occur when talking to a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record or blob not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error from a backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A counter cell held something that is not a number
    #[error("record at {0} is not a counter cell")]
    NotACounter(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
