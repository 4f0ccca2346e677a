//! Feature listing (§4.8): "list features forces a disk sync" — unlike the
//! watcher's 3-second cadence, a direct API read reconciles immediately.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;

use super::AppState;
use crate::error::Result;
use crate::persistence::Feature;
use crate::watcher;

pub async fn list_features(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Feature>>> {
    let project = state.orchestrator.persistence.load_project(&id)?;
    let cached = state.orchestrator.persistence.load_features(&id).unwrap_or_default();
    let synced = watcher::sync_once(&project.project_dir, &cached)?;
    if synced.changed {
        state.orchestrator.persistence.save_features(&id, &synced.features)?;
    }
    Ok(Json(synced.features.features))
}
