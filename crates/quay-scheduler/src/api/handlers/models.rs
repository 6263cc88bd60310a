//! Model and server handlers

use crate::api::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use quay_types::{LoadModelRequest, ModelSnapshot, ServerSnapshot};
use serde::Serialize;

/// Apply model response
#[derive(Debug, Serialize)]
pub struct ApplyModelResponse {
    pub name: String,
    pub version: u32,
}

/// Create or update a model
pub async fn apply_model(
    State(state): State<AppState>,
    Json(request): Json<LoadModelRequest>,
) -> ApiResult<(StatusCode, Json<ApplyModelResponse>)> {
    let name = request.model.name().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("model name must not be empty".into()));
    }
    let version = state.server.apply_model(request).await?;
    Ok((StatusCode::CREATED, Json(ApplyModelResponse { name, version })))
}

/// List all models
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Vec<ModelSnapshot>>> {
    Ok(Json(state.server.store().get_models().await?))
}

/// Get one model with all its versions
pub async fn get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ModelSnapshot>> {
    state
        .server
        .store()
        .get_model(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Model {} not found", name)))
}

/// Delete a model; replicas unload asynchronously
pub async fn delete_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.server.remove_model(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

/// List all servers
pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerSnapshot>>> {
    Ok(Json(state.server.store().get_servers().await?))
}
