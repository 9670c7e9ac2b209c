//! HTTP endpoints beside the WebSocket: health and session inspection.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tally_core::{SessionId, SessionState};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::server::AppState;

pub const SERVICE_NAME: &str = "tally";

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE_NAME }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionId>,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    Json(SessionList {
        sessions: state.registry.ids(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub status: String,
}

/// Idempotent: an existing session is returned as if freshly created.
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| {
        debug!(error = %e, "rejected create_session body");
        ApiError::validation_error(e.body_text())
    })?;
    let raw = request.session_id.trim();
    if raw.is_empty() {
        return Err(ApiError::validation_error("sessionId must not be empty"));
    }

    let session = state.registry.get_or_create(&SessionId::from_raw(raw));
    info!(session_id = %session.id(), "session created via api");
    Ok(Json(CreateSessionResponse {
        session_id: session.id().clone(),
        status: "created".to_string(),
    }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    state
        .registry
        .get(&SessionId::from_raw(id.as_str()))
        .map(|session| Json(session.state()))
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))
}
