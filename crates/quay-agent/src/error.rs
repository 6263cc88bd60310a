//! Agent error types

use thiserror::Error;

/// Failures talking to the inference server
#[derive(Debug, Error)]
pub enum BackendError {
    /// The server refused the request (4xx). For a load this usually means
    /// the model is unknown to the server's repository.
    #[error("Backend rejected {operation} of {model}: {status} {message}")]
    Rejected {
        operation: &'static str,
        model: String,
        status: u16,
        message: String,
    },

    /// The server accepted the request but failed to carry it out (5xx)
    #[error("Backend failed {operation} of {model}: {status} {message}")]
    Failed {
        operation: &'static str,
        model: String,
        status: u16,
        message: String,
    },

    /// The server could not be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, BackendError::Rejected { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

/// Result type for backend calls
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Model cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// The logical model name has not been assigned to this agent
    #[error("Model not registered: {0}")]
    NotRegistered(String),

    #[error("Failed to load {model}: {source}")]
    Load {
        model: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to unload {model}: {source}")]
    Unload {
        model: String,
        #[source]
        source: BackendError,
    },

    /// Every resident model is serving a request, nothing can be evicted
    #[error("Cache full: all {capacity} slots are in use")]
    CapacityExhausted { capacity: usize },

    #[error("Cache task aborted: {0}")]
    Aborted(String),
}

impl CacheError {
    /// Whether the failure means "this model cannot be served here" rather
    /// than "try again later"
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotRegistered(_) => true,
            CacheError::Load { source, .. } => source.is_rejection(),
            _ => false,
        }
    }
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Top-level agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Scheduler request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Scheduler returned {status}: {message}")]
    Scheduler { status: u16, message: String },

    #[error("Invalid message from scheduler: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy already started on {0}")]
    AlreadyStarted(std::net::SocketAddr),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for agent operations
pub type AgentResult<T> = std::result::Result<T, AgentError>;
