//! Application state for API handlers

use crate::server::AgentServer;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Control plane handle
    pub server: Arc<AgentServer>,

    /// Scheduler version
    pub version: String,

    /// Scheduler start time
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Flipped to true on shutdown; closes agent command streams
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(server: Arc<AgentServer>, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            server,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
            shutdown_tx,
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        }
    }
}
