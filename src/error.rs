use thiserror::Error;

use crate::model::JobState;

#[derive(Error, Debug)]
pub enum TitanError {
    #[error("Version conflict on key {0}")]
    Conflict(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Store unreachable: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Illegal job transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TitanError {
    /// True for faults that a retry of the same operation may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TitanError::Conflict(_)
                | TitanError::Timeout(_)
                | TitanError::Connection(_)
                | TitanError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TitanError>;
