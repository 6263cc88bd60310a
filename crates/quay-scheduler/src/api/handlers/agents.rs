//! Agent link handlers
//!
//! The command stream is newline-delimited JSON. Blank lines are sent as
//! keepalives. When the client goes away the response body is dropped,
//! which disconnects the agent.

use super::models::ApplyModelResponse;
use crate::api::state::AppState;
use crate::error::ApiResult;
use crate::server::AgentServer;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::stream;
use quay_types::{
    AgentSubscribeRequest, ModelEventMessage, ModelOperationMessage, ModelScalingTriggerMessage,
    ServerKey,
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Tears the link down when the stream is dropped
struct DisconnectGuard {
    server: Arc<AgentServer>,
    key: ServerKey,
    connection_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let server = self.server.clone();
        let key = self.key.clone();
        let connection_id = self.connection_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = server.disconnect(&key, connection_id).await {
                    warn!(server = %key, error = %e, "Failed to disconnect agent");
                }
            });
        }
    }
}

struct CommandStream {
    rx: mpsc::UnboundedReceiver<ModelOperationMessage>,
    heartbeat: Interval,
    shutdown: watch::Receiver<bool>,
    _guard: DisconnectGuard,
}

fn encode_line(op: &ModelOperationMessage) -> Bytes {
    match serde_json::to_vec(op) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode command");
            Bytes::from_static(b"\n")
        }
    }
}

/// Open an agent's command stream
pub async fn subscribe_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentSubscribeRequest>,
) -> ApiResult<Response> {
    let key = request.server_key();
    let (connection_id, rx) = state.server.subscribe(request).await?;

    let mut heartbeat = tokio::time::interval(state.server.config().heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let commands = CommandStream {
        rx,
        heartbeat,
        shutdown: state.shutdown_tx.subscribe(),
        _guard: DisconnectGuard {
            server: state.server.clone(),
            key,
            connection_id,
        },
    };

    // Ends when the registry drops the sender (the link was replaced) or on
    // shutdown
    let body = stream::unfold(commands, |mut s| async move {
        loop {
            tokio::select! {
                op = s.rx.recv() => {
                    return Some((Ok::<_, Infallible>(encode_line(&op?)), s));
                }
                _ = s.heartbeat.tick() => {
                    return Some((Ok(Bytes::from_static(b"\n")), s));
                }
                changed = s.shutdown.changed() => {
                    if changed.is_err() || *s.shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    });

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response())
}

/// Agent event response
#[derive(Debug, Serialize)]
pub struct AgentEventResponse {
    /// False when the event was stale and ignored
    pub applied: bool,
}

/// Apply an agent's command outcome
pub async fn agent_event(
    State(state): State<AppState>,
    Json(event): Json<ModelEventMessage>,
) -> ApiResult<Json<AgentEventResponse>> {
    let applied = state.server.handle_agent_event(&event).await?;
    Ok(Json(AgentEventResponse { applied }))
}

/// Apply a scale trigger
pub async fn scaling_trigger(
    State(state): State<AppState>,
    Json(trigger): Json<ModelScalingTriggerMessage>,
) -> ApiResult<(StatusCode, Json<ApplyModelResponse>)> {
    let version = state.server.handle_scaling_trigger(&trigger).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApplyModelResponse {
            name: trigger.model_name,
            version,
        }),
    ))
}
