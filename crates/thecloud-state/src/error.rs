//! Error types for the TheCloud state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    /// A redb transaction, table or read/write step failed.
    #[error("storage error during {op}: {message}")]
    Storage { op: &'static str, message: String },

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode {table} record: {message}")]
    Decode { table: &'static str, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }
}
