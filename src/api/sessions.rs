//! Session listing, log listing, and raw per-session log streaming (§4.8).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;

use super::AppState;
use crate::error::{OrchestratorError, Result};
use crate::persistence::{LogEntry, Session};

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.orchestrator.persistence.load_sessions(&id)?))
}

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogEntry>>> {
    Ok(Json(state.orchestrator.persistence.read_logs(&id)?))
}

const RAW_LOG_TAIL_BYTES: u64 = 200 * 1024;

/// Stream the last 200 KB of a session's verbatim raw log. The path must
/// resolve under `<dataDir>/claude-logs/` (§4.5) — this is a narrower check
/// than the general path sandbox since the caller supplies only a session
/// id, not a path, but the resolved path is still verified before reading.
pub async fn get_session_raw_log(
    State(state): State<Arc<AppState>>,
    Path((project_id, session_id)): Path<(String, String)>,
) -> Result<Bytes> {
    let sessions = state.orchestrator.persistence.load_sessions(&project_id)?;
    let session = sessions
        .iter()
        .find(|s| s.id == session_id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
    let path = session
        .log_path
        .clone()
        .unwrap_or_else(|| state.orchestrator.persistence.raw_log_path(&session_id));

    let claude_logs_dir = std::fs::canonicalize(state.orchestrator.persistence.claude_logs_dir())
        .map_err(|e| OrchestratorError::UnsafePath(format!("claude-logs dir missing: {e}")))?;
    let resolved = std::fs::canonicalize(&path)
        .map_err(|e| OrchestratorError::NotFound(format!("{}: {e}", path.display())))?;
    if !resolved.starts_with(&claude_logs_dir) {
        return Err(OrchestratorError::UnsafePath(format!("{} is outside claude-logs", path.display())));
    }

    let contents = std::fs::read(&resolved)?;
    let tail = if contents.len() as u64 > RAW_LOG_TAIL_BYTES {
        contents[contents.len() - RAW_LOG_TAIL_BYTES as usize..].to_vec()
    } else {
        contents
    };
    Ok(Bytes::from(tail))
}
