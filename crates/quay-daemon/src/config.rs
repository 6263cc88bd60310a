//! Configuration for quayd
//!
//! Sources, lowest precedence first: built-in defaults, an optional file,
//! then `QUAY_`-prefixed environment variables with `__` between nested
//! keys (e.g. `QUAY_AGENT__CACHE_CAPACITY=20`).

use crate::error::DaemonResult;
use quay_agent::AgentConfig;
use quay_scheduler::AgentServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Scheduler role
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Agent role
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Control surface listen address
    #[serde(default = "default_scheduler_addr")]
    pub listen_addr: SocketAddr,

    #[serde(flatten)]
    pub agent_server: AgentServerConfig,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_scheduler_addr(),
            agent_server: AgentServerConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_scheduler_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9004))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, `path` and the environment
    pub fn load(path: Option<&str>) -> DaemonResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("QUAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("agent.capabilities")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
