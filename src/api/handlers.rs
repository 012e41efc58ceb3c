//! HTTP request handlers for the message management service.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::ApiError;
use crate::error::Error;
use crate::messaging::MessageManager;
use crate::types::{
    BulkResult, ConnectionInfo, EncodedBody, Headers, Liveness, MessageView, PurgeResult, Queue,
    RegisterConnectionRequest,
};

/// Default number of messages returned by a peek.
const DEFAULT_PEEK_LIMIT: usize = 50;

type ApiResult<T> = Result<T, ApiError>;

/// Application state shared across handlers.
pub struct AppState {
    pub manager: MessageManager,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

/// Health check endpoint.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionInfo>> {
    Json(state.manager.registry().list().await)
}

pub async fn register_connection(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterConnectionRequest>,
) -> ApiResult<(StatusCode, Json<ConnectionInfo>)> {
    let info = state.manager.register_connection(request).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<Json<ConnectionInfo>> {
    Ok(Json(state.manager.registry().connection(connection_id).await?))
}

pub async fn remove_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.manager.registry().remove(connection_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub id: Uuid,
    pub liveness: Liveness,
}

/// Re-probe a connection.
pub async fn refresh_liveness(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<Json<LivenessResponse>> {
    let liveness = state
        .manager
        .registry()
        .refresh_liveness(connection_id)
        .await?;
    Ok(Json(LivenessResponse {
        id: connection_id,
        liveness,
    }))
}

pub async fn list_queues(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Queue>>> {
    Ok(Json(state.manager.list_queues(connection_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PeekQuery {
    pub limit: Option<usize>,
}

/// Peek at the head of a queue.
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Query(query): Query<PeekQuery>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PEEK_LIMIT);
    let messages = state
        .manager
        .get_messages(connection_id, &queue, limit)
        .await?;
    Ok(Json(messages.iter().map(MessageView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: EncodedBody,
    #[serde(default)]
    pub headers: Headers,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<StatusCode> {
    let body = request.body.decode().map_err(Error::InvalidRequest)?;
    state
        .manager
        .send_message(connection_id, &queue, body, request.headers)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn purge_queue(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
) -> ApiResult<Json<PurgeResult>> {
    info!(connection_id = %connection_id, queue = %queue, "Purge requested");
    Ok(Json(state.manager.purge_queue(connection_id, &queue).await?))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue, message_id)): Path<(Uuid, String, String)>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .delete_message(connection_id, &queue, &message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MoveMessageRequest {
    pub target_queue: String,
}

pub async fn move_message(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue, message_id)): Path<(Uuid, String, String)>,
    Json(request): Json<MoveMessageRequest>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .move_message(connection_id, &queue, &request.target_queue, &message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

pub async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Json(request): Json<BulkDeleteRequest>,
) -> ApiResult<Json<BulkResult>> {
    let result = state
        .manager
        .bulk_delete_messages(connection_id, &queue, request.ids)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct BulkMoveRequest {
    pub target_queue: String,
    pub ids: Vec<String>,
}

pub async fn bulk_move(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Json(request): Json<BulkMoveRequest>,
) -> ApiResult<Json<BulkResult>> {
    let result = state
        .manager
        .bulk_move_messages(connection_id, &queue, &request.target_queue, request.ids)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub bodies: Vec<EncodedBody>,
}

pub async fn import_messages(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<Json<BulkResult>> {
    let result = state
        .manager
        .import_messages(connection_id, &queue, request.bodies)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub ids: Vec<String>,
}

pub async fn export_messages(
    State(state): State<Arc<AppState>>,
    Path((connection_id, queue)): Path<(Uuid, String)>,
    Json(request): Json<ExportRequest>,
) -> ApiResult<Json<Vec<EncodedBody>>> {
    let bodies = state
        .manager
        .export_messages(connection_id, &queue, request.ids)
        .await?;
    Ok(Json(bodies.iter().map(EncodedBody::encode).collect()))
}
