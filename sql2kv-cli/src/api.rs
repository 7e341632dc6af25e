//! HTTP API.
//!
//! Every route lives under `/sql2kv` and speaks JSON. Errors use one envelope,
//! `{"error": {"code", "message"}}`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sql2kv_core::{
    EngineId, ImportClient, ImportError, KeyRange, SessionError, SessionInfo, SessionRegistry,
};
use sql2kv_proto::SwitchMode;
use tracing::{error, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub import: ImportClient,
    pub sessions: Arc<SessionRegistry>,
}

impl ApiState {
    #[must_use]
    pub const fn new(import: ImportClient, sessions: Arc<SessionRegistry>) -> Self {
        Self { import, sessions }
    }
}

#[derive(Debug)]
pub enum ApiError {
    /// Malformed body, path parameter or SQL.
    InvalidInput(String),
    /// Unknown session id.
    SessionNotFound(String),
    /// Pipeline, transport or remote failure.
    SystemError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg),
            Self::SessionNotFound(id) => (
                StatusCode::BAD_REQUEST,
                "SESSION_NOT_FOUND",
                format!("session `{id}` does not exist"),
            ),
            Self::SystemError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "SYSTEM_ERROR", msg),
        };
        if status.is_server_error() {
            error!(code, %message, "request failed");
        } else {
            warn!(code, %message, "request rejected");
        }
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        Self::SystemError(err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            SessionError::Encode(_) | SessionError::TableMismatch { .. } => {
                Self::InvalidInput(err.to_string())
            }
            SessionError::Catalog(_) | SessionError::Import(_) => Self::SystemError(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidInput(rejection.body_text())
    }
}

/// Body extraction with rejections reported in the API error envelope.
type JsonBody<T> = Result<Json<T>, JsonRejection>;

fn parse_engine_id(raw: &str) -> Result<EngineId, ApiError> {
    raw.parse()
        .map_err(|err| ApiError::InvalidInput(format!("invalid engine id `{raw}`: {err}")))
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub engine_id: String,
    pub schema_name: String,
    pub table_name: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub sqls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub rows: u64,
}

/// Mode as either its numeric value or its name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ModeValue {
    Number(i32),
    Name(String),
}

impl TryFrom<ModeValue> for SwitchMode {
    type Error = ApiError;

    fn try_from(value: ModeValue) -> Result<Self, Self::Error> {
        let mode = match &value {
            ModeValue::Number(n) => Self::try_from(*n).ok(),
            ModeValue::Name(name) => Self::from_str_name(&name.to_ascii_uppercase()),
        };
        mode.ok_or_else(|| ApiError::InvalidInput(format!("unknown mode {value:?}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct SwitchModeRequest {
    pub pd_addr: String,
    pub mode: ModeValue,
}

#[derive(Debug, Deserialize)]
pub struct CompactTableRequest {
    pub pd_addr: String,
    pub table_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ImportEngineRequest {
    pub pd_addr: String,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn open_engine(
    State(state): State<ApiState>,
    Path(engine_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = parse_engine_id(&engine_id)?;
    state.import.open_engine(engine).await?;
    Ok(Json(json!({ "engine_id": engine })))
}

async fn close_engine(
    State(state): State<ApiState>,
    Path(engine_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = parse_engine_id(&engine_id)?;
    state.import.close_engine(engine).await?;
    Ok(Json(json!({ "engine_id": engine })))
}

async fn cleanup_engine(
    State(state): State<ApiState>,
    Path(engine_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = parse_engine_id(&engine_id)?;
    state.import.cleanup_engine(engine).await?;
    Ok(Json(json!({ "engine_id": engine })))
}

async fn open_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    body: JsonBody<OpenSessionRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let Json(request) = body?;
    let engine = parse_engine_id(&request.engine_id)?;
    let session = state
        .sessions
        .open_session(&session_id, engine, &request.schema_name, &request.table_name)
        .await?;
    Ok(Json(session.info()))
}

async fn session_info(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.sessions.info(&session_id).await?))
}

async fn write_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    body: JsonBody<WriteRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let Json(request) = body?;
    let rows = state.sessions.write(&session_id, &request.sqls).await?;
    Ok(Json(WriteResponse { rows }))
}

async fn close_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let closed = state.sessions.close_session(&session_id).await?;
    Ok(Json(json!({ "session_id": session_id, "closed": closed })))
}

async fn switch_mode(
    State(state): State<ApiState>,
    body: JsonBody<SwitchModeRequest>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let mode = SwitchMode::try_from(request.mode)?;
    state.import.switch_mode(&request.pd_addr, mode).await?;
    Ok(Json(json!({ "mode": mode.as_str_name() })))
}

async fn compact_table(
    State(state): State<ApiState>,
    body: JsonBody<CompactTableRequest>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    state
        .import
        .compact_range(&request.pd_addr, &KeyRange::table(request.table_id))
        .await?;
    Ok(Json(json!({ "table_id": request.table_id })))
}

async fn import_engine(
    State(state): State<ApiState>,
    Path(engine_id): Path<String>,
    body: JsonBody<ImportEngineRequest>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let engine = parse_engine_id(&engine_id)?;
    state.import.import_engine(engine, &request.pd_addr).await?;
    Ok(Json(json!({ "engine_id": engine })))
}

fn sql2kv_routes() -> Router<ApiState> {
    Router::new()
        .route("/engines/{engine_id}/open", post(open_engine))
        .route("/engines/{engine_id}/close", post(close_engine))
        .route("/engines/{engine_id}/cleanup", post(cleanup_engine))
        .route("/sessions/{session_id}", get(session_info))
        .route("/sessions/{session_id}/open", post(open_session))
        .route("/sessions/{session_id}/write", post(write_session))
        .route("/sessions/{session_id}/close", post(close_session))
        .route("/import/switch_mode", post(switch_mode))
        .route("/import/compact_table", post(compact_table))
        .route("/import/engines/{engine_id}", post(import_engine))
}

/// Full router; attach state with `.with_state(..)`.
pub fn create_api_routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .nest("/sql2kv", sql2kv_routes())
}
