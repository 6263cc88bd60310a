//! quayd - quay model serving daemon
//!
//! One binary, two roles:
//! - `quayd scheduler`: model store, agent links, reconciliation and the
//!   HTTP control surface
//! - `quayd agent`: model cache and reverse proxy in front of one inference
//!   server replica, linked to the scheduler

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod server;

use config::DaemonConfig;

/// quay daemon CLI
#[derive(Parser)]
#[command(name = "quayd")]
#[command(about = "quay - model serving scheduler and agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUAY_CONFIG", global = true)]
    config: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "QUAY_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "QUAY_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane
    Scheduler {
        /// Control surface listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Run an agent next to an inference server
    Agent {
        /// Reverse proxy listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Scheduler base URL
        #[arg(long)]
        scheduler_url: Option<String>,

        /// Inference server base URL
        #[arg(long)]
        backend_url: Option<String>,

        /// Server name reported to the scheduler
        #[arg(long)]
        server_name: Option<String>,

        /// Replica index within the server
        #[arg(long)]
        replica_idx: Option<u32>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        DaemonConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    match cli.command {
        Command::Scheduler { listen } => {
            if let Some(addr) = listen {
                config.scheduler.listen_addr = addr;
            }
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting quay scheduler");
            server::run_scheduler(config).await?;
        }
        Command::Agent {
            listen,
            scheduler_url,
            backend_url,
            server_name,
            replica_idx,
        } => {
            let agent = &mut config.agent;
            if let Some(addr) = listen {
                agent.proxy.listen_addr = addr;
            }
            if let Some(url) = scheduler_url {
                agent.scheduler_url = url;
            }
            if let Some(url) = backend_url {
                agent.proxy.backend_url = url.clone();
                agent.backend_url = url;
            }
            if let Some(name) = server_name {
                agent.server_name = name;
            }
            if let Some(idx) = replica_idx {
                agent.replica_idx = idx;
            }
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                server = %agent.server_name,
                replica = agent.replica_idx,
                "Starting quay agent"
            );
            server::run_agent(config).await?;
        }
    }

    Ok(())
}
