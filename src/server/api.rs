use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::context::ConversationContext;
use crate::errors::{SandboxError, TurnError};
use crate::orchestrator::GenerationOrchestrator;
use crate::sandbox::SandboxSession;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub ui_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(default)]
    pub restore: bool,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub prompt: String,
    /// Answer with the outcome instead of 202 once the turn is queued
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReapplyRequest {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub session_id: String,
    pub files: BTreeMap<String, String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TurnError> for ApiError {
    fn from(err: TurnError) -> Self {
        let msg = err.to_string();
        match err {
            TurnError::EmptyPrompt => ApiError::BadRequest(msg),
            TurnError::Generation(_) => ApiError::BadGateway(msg),
            TurnError::NothingApplied { .. } => ApiError::Unprocessable(msg),
            TurnError::Discarded(_) => ApiError::Conflict(msg),
            TurnError::Sandbox(SandboxError::NoActiveSession) | TurnError::NothingToReapply => {
                ApiError::NotFound(msg)
            }
            TurnError::Sandbox(_) | TurnError::Apply(_) | TurnError::Other(_) => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        if err.is_session_lost() {
            ApiError::NotFound(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/sandbox",
            get(get_sandbox).post(create_sandbox).delete(kill_sandbox),
        )
        .route("/api/sandbox/files", get(list_sandbox_files))
        .route("/api/turns", post(run_turn))
        .route("/api/turns/reapply", post(reapply_turn))
        .route("/api/context", get(get_context))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn active_session(state: &SharedState) -> Result<SandboxSession, ApiError> {
    state
        .orchestrator
        .manager()
        .active()
        .await
        .ok_or_else(|| ApiError::NotFound("No active sandbox".into()))
}

async fn get_sandbox(State(state): State<SharedState>) -> Result<Json<SandboxSession>, ApiError> {
    Ok(Json(active_session(&state).await?))
}

async fn create_sandbox(
    State(state): State<SharedState>,
    body: Option<Json<CreateSandboxRequest>>,
) -> Result<(StatusCode, Json<SandboxSession>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let session = state.orchestrator.create_session(request.restore).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn kill_sandbox(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    let session = active_session(&state).await?;
    state.orchestrator.manager().kill(&session.id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sandbox_files(
    State(state): State<SharedState>,
) -> Result<Json<FileListing>, ApiError> {
    let session = active_session(&state).await?;
    let files = state.orchestrator.manager().list_files(&session.id).await?;
    Ok(Json(FileListing {
        session_id: session.id,
        files,
    }))
}

async fn run_turn(
    State(state): State<SharedState>,
    Json(request): Json<TurnRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(TurnError::EmptyPrompt.into());
    }
    if request.wait {
        let outcome = state.orchestrator.run_turn(&request.prompt).await?;
        return Ok(Json(outcome).into_response());
    }

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_turn(&request.prompt).await {
            warn!(error = %e, "background turn failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true})),
    )
        .into_response())
}

async fn reapply_turn(
    State(state): State<SharedState>,
    body: Option<Json<ReapplyRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if request.wait {
        let outcome = state.orchestrator.reapply_last().await?;
        return Ok(Json(outcome).into_response());
    }

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.reapply_last().await {
            warn!(error = %e, "background reapply failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true})),
    )
        .into_response())
}

async fn get_context(State(state): State<SharedState>) -> Json<ConversationContext> {
    Json(state.orchestrator.context().await)
}
