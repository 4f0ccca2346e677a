//! Pending help-request listing and response submission (§4.8).
//!
//! Submitting a response writes `<projectDir>/.human-response.md` so the
//! next agent session can read human context, and auto-restarts the agent
//! if the project is not currently running and not `completed`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;

use super::AppState;
use crate::error::{OrchestratorError, Result};
use crate::persistence::{HelpRequest, HelpRequestStatus};
use crate::state::ProjectStatus;

pub async fn list_help_requests(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HelpRequest>>> {
    let all = state.orchestrator.persistence.load_help_requests(&id)?;
    Ok(Json(all.into_iter().filter(|r| r.status == HelpRequestStatus::Pending).collect()))
}

#[derive(Debug, Deserialize)]
pub struct HelpResponseRequest {
    pub project_id: String,
    pub response: String,
}

pub async fn submit_help_response(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Json(req): Json<HelpResponseRequest>,
) -> Result<Json<HelpRequest>> {
    let resolved = state.orchestrator.persistence.resolve_help_request(
        &req.project_id,
        &request_id,
        req.response.clone(),
        Utc::now(),
    )?;

    write_human_response(&state, &resolved)?;

    let project = state.orchestrator.persistence.load_project(&req.project_id)?;
    if !matches!(project.status, ProjectStatus::Running | ProjectStatus::Initializing | ProjectStatus::Reviewing)
        && project.status != ProjectStatus::Completed
    {
        // Best-effort: an `AlreadyRunning` race here is not an error the
        // caller needs to see.
        let _ = state.orchestrator.start_agent(&req.project_id).await;
    }

    Ok(Json(resolved))
}

fn write_human_response(state: &AppState, request: &HelpRequest) -> Result<()> {
    let project = state.orchestrator.persistence.load_project(&request.project_id)?;

    let task = request
        .feature_context
        .as_ref()
        .map(|f| format!("{} ({})", f.id, f.description))
        .unwrap_or_else(|| "(no feature context)".to_string());

    let recent_logs = request
        .log_snapshot
        .as_ref()
        .map(|logs| logs.iter().map(|l| format!("- [{:?}] {}", l.kind, l.content)).collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();

    let response = request.response.as_deref().ok_or_else(|| {
        OrchestratorError::InvalidInput("help request has no response to write".into())
    })?;

    let content = format!(
        "# Human response\n\n## Current task\n{task}\n\n## Problem\n{message}\n\n## Recent logs\n{recent_logs}\n\n## Guidance\n{response}\n",
        message = request.message,
    );
    std::fs::write(project.project_dir.join(".human-response.md"), content)?;
    Ok(())
}
