//! Model-aware reverse proxy
//!
//! Inbound requests carry the logical model name in
//! [`INTERNAL_MODEL_HEADER`]. The proxy resolves that name through the
//! [`CacheManager`] (loading on a miss), rewrites the model segment of the
//! path to the backend name, forwards to the inference server and streams
//! the response back. The model stays pinned in the cache until the
//! response body has been fully relayed.

use crate::cache::CacheManager;
use crate::config::ProxyConfig;
use crate::error::{AgentError, AgentResult, CacheError};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use futures_util::StreamExt;
use regex::Regex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Header carrying the logical model name a request is meant for
pub const INTERNAL_MODEL_HEADER: &str = "x-quay-internal-model";

static MODEL_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/v2/models/)([\w\-]+)((?:/versions/\w+)?(?:/.*)?)$")
        .expect("valid model path regex")
});

static REPOSITORY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/v2/repository/models/)([\w\-]+)(/.*)?$")
        .expect("valid repository path regex")
});

/// Replace the model name segment of an inference path with `model_name`.
///
/// Paths outside the model grammar (server health, metadata) are returned
/// unchanged.
pub fn rewrite_path(path: &str, model_name: &str) -> String {
    for re in [&*MODEL_PATH, &*REPOSITORY_PATH] {
        if let Some(caps) = re.captures(path) {
            return format!(
                "{}{}{}",
                &caps[1],
                model_name,
                caps.get(3).map_or("", |m| m.as_str())
            );
        }
    }
    path.to_string()
}

/// Proxy-level failures, rendered as JSON error responses
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Missing x-quay-internal-model header")]
    MissingModelHeader,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        if err.is_not_found() {
            ProxyError::ModelNotFound(err.to_string())
        } else {
            ProxyError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProxyError::MissingModelHeader | ProxyError::ModelNotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ProxyError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ProxyError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ProxyError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ProxyError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct ProxyState {
    cache: CacheManager,
    client: reqwest::Client,
    backend_url: Arc<str>,
    request_timeout: Duration,
    max_body_size: usize,
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn model_header(headers: &HeaderMap) -> Result<String, ProxyError> {
    headers
        .get(INTERNAL_MODEL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ProxyError::MissingModelHeader)
}

async fn forward(
    State(state): State<ProxyState>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let model = model_header(&parts.headers)?;

    let lease = tokio::time::timeout(state.request_timeout, state.cache.acquire(&model))
        .await
        .map_err(|_| ProxyError::Timeout(state.request_timeout))??;

    let mut url = format!(
        "{}{}",
        state.backend_url,
        rewrite_path(parts.uri.path(), lease.backend_name())
    );
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }
    debug!(model = %model, backend = lease.backend_name(), %url, "Forwarding request");

    let body = axum::body::to_bytes(body, state.max_body_size)
        .await
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let mut upstream = state.client.request(method, &url).body(body);
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == INTERNAL_MODEL_HEADER {
            continue;
        }
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }

    let upstream = upstream.send().await.map_err(|e| {
        warn!(model = %model, error = %e, "Backend request failed");
        if e.is_timeout() {
            ProxyError::Timeout(state.request_timeout)
        } else {
            ProxyError::Unavailable(e.to_string())
        }
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }

    let stream = upstream.bytes_stream().map(move |chunk| {
        // Keep the model pinned until the last chunk is relayed
        let _pinned = &lease;
        chunk
    });
    response
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Reverse proxy with a Stopped/Ready lifecycle
pub struct ReverseProxy {
    config: ProxyConfig,
    state: ProxyState,
    ready: Arc<AtomicBool>,
    running: Mutex<Option<RunningProxy>>,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig, cache: CacheManager) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .no_proxy()
            .build()?;
        let state = ProxyState {
            cache,
            client,
            backend_url: config.backend_url.trim_end_matches('/').into(),
            request_timeout: config.request_timeout(),
            max_body_size: config.max_body_size,
        };
        Ok(Self {
            config,
            state,
            ready: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(forward)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listener and begin serving; returns the bound address
    pub async fn start(&self) -> AgentResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Err(AgentError::AlreadyStarted(r.local_addr));
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let router = self.router();
        let ready = Arc::clone(&self.ready);

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            ready.store(false, Ordering::Release);
            if let Err(e) = result {
                error!(error = %e, "Reverse proxy terminated");
            }
        });

        self.ready.store(true, Ordering::Release);
        info!(addr = %local_addr, backend = %self.state.backend_url, "Reverse proxy listening");
        *running = Some(RunningProxy {
            local_addr,
            shutdown,
            handle,
        });
        Ok(local_addr)
    }

    /// Stop accepting connections and drain in-flight requests
    pub async fn stop(&self) -> AgentResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        self.ready.store(false, Ordering::Release);
        let _ = running.shutdown.send(());

        let mut handle = running.handle;
        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!(?timeout, "Reverse proxy did not drain in time, aborting");
            handle.abort();
        }
        info!(addr = %running.local_addr, "Reverse proxy stopped");
        Ok(())
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub fn cache(&self) -> &CacheManager {
        &self.state.cache
    }
}
