//! Agent configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Everything one agent process needs to know about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the server this agent fronts
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Replica index within the server
    #[serde(default)]
    pub replica_idx: u32,

    /// Whether models from any owner may be placed on this server
    #[serde(default = "default_true")]
    pub shared: bool,

    /// Capabilities advertised to placement (e.g. "sklearn", "gpu")
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Memory the inference server has for models
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    /// Maximum number of concurrently resident model versions
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Base URL of the scheduler control surface
    #[serde(default = "default_scheduler_url")]
    pub scheduler_url: String,

    /// Base URL of the inference server
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Host the scheduler should use to reach this replica
    #[serde(default = "default_inference_svc")]
    pub inference_svc: String,

    /// Timeout for load/unload/infer calls, in seconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub reconnect_max_backoff_ms: u64,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            replica_idx: 0,
            shared: true,
            capabilities: Vec::new(),
            memory_bytes: default_memory_bytes(),
            cache_capacity: default_cache_capacity(),
            scheduler_url: default_scheduler_url(),
            backend_url: default_backend_url(),
            inference_svc: default_inference_svc(),
            backend_timeout_secs: default_backend_timeout(),
            reconnect_initial_backoff_ms: default_initial_backoff(),
            reconnect_max_backoff_ms: default_max_backoff(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    /// At least 1ms
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms).max(self.initial_backoff())
    }
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address; port 0 picks an ephemeral port
    #[serde(default = "default_proxy_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL requests are forwarded to
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Per-request timeout in seconds, covering any load on a cache miss
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// How long `stop` waits for in-flight requests to drain
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_proxy_addr(),
            backend_url: default_backend_url(),
            request_timeout_secs: default_request_timeout(),
            max_body_size: default_max_body_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_server_name() -> String {
    "mlserver".to_string()
}

fn default_memory_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GiB
}

fn default_cache_capacity() -> usize {
    10
}

fn default_scheduler_url() -> String {
    "http://127.0.0.1:9004".to_string()
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_inference_svc() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_timeout() -> u64 {
    120
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_proxy_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9999))
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_shutdown_timeout() -> u64 {
    5
}
