//! HTTP + WebSocket surface (§4.8): a thin adapter translating external
//! requests to [`crate::orchestrator::Orchestrator`] calls. Route handlers
//! never embed orchestration logic themselves — they validate input, call
//! the orchestrator or persistence, and map the result to a response.

pub mod features;
pub mod help;
pub mod projects;
pub mod providers;
pub mod sessions;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::sandbox;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub token: Option<String>,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::UnsafePath(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::AlreadyRunning => StatusCode::CONFLICT,
            OrchestratorError::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::GitFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Json(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Persistence(crate::persistence::PersistenceError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Claim(_) => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
}

/// Bearer-header or query-param token check (§4.8). A no-op when the server
/// has no configured token.
async fn require_token(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.token else {
        return next.run(request).await;
    };
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let provided = bearer.or(query.token.as_deref());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing or invalid token" }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    pub path: String,
}

#[derive(Debug, serde::Serialize)]
pub struct ProbeEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Probe a directory for contents, subject to the path sandbox (§4.5).
async fn probe_directory(
    Query(query): Query<ProbeQuery>,
) -> Result<Json<Vec<ProbeEntry>>, OrchestratorError> {
    let path = sandbox::check_path(std::path::Path::new(&query.path))?;
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&path)? {
        let entry = entry?;
        entries.push(ProbeEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: entry.file_type()?.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(entries))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Assemble the full router: `/health` is unauthenticated, everything under
/// `/api` (including the subscribe upgrade) requires the token when
/// configured, checked as a bearer header or a `?token=` query parameter —
/// the latter is what lets a browser's WebSocket client authenticate, since
/// it cannot set a custom header on the upgrade request.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let api_routes = Router::new()
        .route("/projects", get(projects::list_projects).post(projects::create_project))
        .route("/projects/import", post(projects::import_project))
        .route("/projects/{id}", get(projects::get_project).delete(projects::delete_project))
        .route("/projects/{id}/start", post(projects::start_agent))
        .route("/projects/{id}/stop", post(projects::stop_agent))
        .route("/projects/{id}/system-prompt", put(projects::update_system_prompt))
        .route("/projects/{id}/append-spec", post(projects::append_spec))
        .route("/projects/{id}/review", post(projects::review_features))
        .route("/projects/{id}/confirm-review", post(projects::confirm_review))
        .route("/projects/{id}/features", get(features::list_features))
        .route("/projects/{id}/sessions", get(sessions::list_sessions))
        .route("/projects/{id}/sessions/{session_id}/raw-log", get(sessions::get_session_raw_log))
        .route("/projects/{id}/logs", get(sessions::list_logs))
        .route("/projects/{id}/help-requests", get(help::list_help_requests))
        .route("/help-requests/{id}/respond", post(help::submit_help_response))
        .route("/providers", get(providers::list_providers))
        .route("/probe-directory", post(probe_directory))
        .route("/projects/{id}/subscribe", get(ws::subscribe))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_token));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(state)
}
