//! Store error types

use quay_types::ModelReplicaState;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model version not found: {model}:{version}")]
    VersionNotFound { model: String, version: u32 },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The replica moved on since the reporter last looked at it
    #[error(
        "Stale state update for {model}:{version} replica {replica_idx}: expected {expected}, found {actual}"
    )]
    StaleStateUpdate {
        model: String,
        version: u32,
        replica_idx: u32,
        expected: ModelReplicaState,
        actual: ModelReplicaState,
    },

    #[error("Invalid transition for {model}:{version} replica {replica_idx}: {from} -> {to}")]
    InvalidTransition {
        model: String,
        version: u32,
        replica_idx: u32,
        from: ModelReplicaState,
        to: ModelReplicaState,
    },

    #[error("Model {model}:{version} is placed on {placed}, not {reported}")]
    ServerMismatch {
        model: String,
        version: u32,
        placed: String,
        reported: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleStateUpdate { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
