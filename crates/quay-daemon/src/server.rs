//! Role startup and lifecycle management

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use quay_agent::{AgentLink, BackendClient, CacheManager, ModelRegistry, ReverseProxy, V2Client};
use quay_scheduler::{create_router, AgentRegistry, AgentServer, AppState};
use quay_store::{InMemoryModelStore, ModelStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Run the control plane until a shutdown signal arrives
pub async fn run_scheduler(config: DaemonConfig) -> DaemonResult<()> {
    let addr = config.scheduler.listen_addr;

    let store: Arc<dyn ModelStore> = Arc::new(InMemoryModelStore::default());
    let agents = Arc::new(AgentRegistry::new());
    let server = Arc::new(AgentServer::new(
        store,
        agents,
        config.scheduler.agent_server.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_loop = tokio::spawn(server.clone().run(shutdown_rx));

    let app = create_router(AppState::new(server, shutdown_tx.clone()));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("quay scheduler listening on {}", addr);

    // Agent command streams only end once shutdown is flagged, so the flag
    // has to flip before axum waits for connections to drain
    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .await
        .map_err(|e| DaemonError::Server(e.to_string()))?;

    tracing::info!("quay scheduler shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = event_loop.await {
        tracing::warn!(error = %e, "Event loop ended abnormally");
    }
    Ok(())
}

/// Run one agent: proxy in front of the inference server plus the scheduler
/// link, until a shutdown signal arrives
pub async fn run_agent(config: DaemonConfig) -> DaemonResult<()> {
    let agent = config.agent;

    let backend = Arc::new(V2Client::new(&agent.backend_url, agent.backend_timeout())?);
    match backend.ready().await {
        Ok(true) => tracing::info!(backend = %agent.backend_url, "Inference server ready"),
        Ok(false) => tracing::warn!(backend = %agent.backend_url, "Inference server not ready yet"),
        Err(e) => tracing::warn!(backend = %agent.backend_url, error = %e, "Inference server readiness check failed"),
    }

    let registry = Arc::new(ModelRegistry::new());
    let cache = CacheManager::new(backend, registry, agent.cache_capacity);

    let proxy = ReverseProxy::new(agent.proxy.clone(), cache.clone())?;
    let addr = proxy.start().await?;
    tracing::info!(
        server = %agent.server_name,
        replica = agent.replica_idx,
        capacity = agent.cache_capacity,
        "quay agent proxy listening on {}",
        addr
    );

    let link = AgentLink::new(agent, cache)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_task = tokio::spawn(async move { link.run(shutdown_rx).await });

    shutdown_signal().await;
    tracing::info!("quay agent shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = link_task.await {
        tracing::warn!(error = %e, "Agent link ended abnormally");
    }
    proxy.stop().await?;
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
