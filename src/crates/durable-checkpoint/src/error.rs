//! Error types for history and callback store operations

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors that can occur while reading or writing execution history
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Execution or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record already exists under the same `(execution, namespace, name)` key
    #[error("Record already committed for key {0}")]
    Conflict(String),

    /// Execution already exists
    #[error("Execution already exists: {0}")]
    AlreadyExists(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend cannot be reached
    #[error("History store unavailable: {0}")]
    Unavailable(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored data violates an invariant (e.g. a transition out of a terminal status)
    #[error("Invalid history state: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HistoryError {
    /// Whether the error means the store could not be trusted or reached.
    ///
    /// Conflicts and missing keys are caller-level problems; everything else
    /// is treated as an engine failure by the executor.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HistoryError::NotFound(_) | HistoryError::Conflict(_) | HistoryError::AlreadyExists(_)
        )
    }
}
