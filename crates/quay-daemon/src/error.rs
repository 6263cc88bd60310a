//! Error types for quayd

use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Agent startup or shutdown error
    #[error("Agent error: {0}")]
    Agent(#[from] quay_agent::AgentError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

impl From<quay_agent::BackendError> for DaemonError {
    fn from(e: quay_agent::BackendError) -> Self {
        DaemonError::Agent(e.into())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
