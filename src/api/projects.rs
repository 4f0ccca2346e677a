//! Project CRUD + lifecycle actions (§4.8).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{OrchestratorError, Result};
use crate::ids::new_id;
use crate::persistence::Project;
use crate::sandbox;
use crate::state::ProjectStatus;

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    #[serde(flatten)]
    pub project: Project,
    pub features_total: usize,
    pub features_passed: usize,
    pub active_agents: usize,
}

async fn summarize(state: &AppState, project: Project) -> ProjectSummary {
    let features = state.orchestrator.persistence.load_features(&project.id).unwrap_or_default();
    let (total, passed) = features.counts();
    let active_agents = state.orchestrator.active_agent_count(&project.id).await;
    ProjectSummary { project, features_total: total, features_passed: passed, active_agents }
}

pub async fn list_projects(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ProjectSummary>>> {
    let projects = state.orchestrator.persistence.list_projects()?;
    let mut summaries = Vec::with_capacity(projects.len());
    for project in projects {
        summaries.push(summarize(&state, project).await);
    }
    Ok(Json(summaries))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProjectSummary>> {
    let project = state.orchestrator.persistence.load_project(&id)?;
    Ok(Json(summarize(&state, project).await))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub spec: String,
    pub provider: String,
    pub model: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub use_agent_teams: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub review_before_coding: Option<bool>,
    #[serde(default)]
    pub provider_settings: BTreeMap<String, serde_json::Value>,
    pub project_dir: String,
}

fn default_concurrency() -> u32 {
    1
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>> {
    if req.name.trim().is_empty() || req.spec.trim().is_empty() {
        return Err(OrchestratorError::InvalidInput("name and spec are required".into()));
    }
    let project_dir = sandbox::check_path_for_create(std::path::Path::new(&req.project_dir))?;
    std::fs::create_dir_all(&project_dir)?;
    std::fs::write(project_dir.join("app_spec.txt"), &req.spec)?;

    let now = Utc::now();
    let mut project = Project {
        id: new_id(),
        name: req.name,
        spec: req.spec,
        status: ProjectStatus::Idle,
        provider: req.provider,
        provider_settings: req.provider_settings,
        model: req.model,
        concurrency: req.concurrency,
        use_agent_teams: req.use_agent_teams,
        system_prompt: req.system_prompt,
        review_before_coding: req.review_before_coding,
        project_dir,
        created_at: now,
        updated_at: now,
    };
    project.clamp_concurrency();
    state.orchestrator.persistence.save_project(&project)?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct ImportProjectRequest {
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    pub project_dir: String,
}

/// Import an existing directory that already has an `app_spec.txt` (and,
/// optionally, a `feature_list.json`) on disk.
pub async fn import_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImportProjectRequest>,
) -> Result<Json<Project>> {
    let project_dir = sandbox::check_path(std::path::Path::new(&req.project_dir))?;
    let spec = std::fs::read_to_string(project_dir.join("app_spec.txt")).unwrap_or_default();

    let now = Utc::now();
    let mut project = Project {
        id: new_id(),
        name: req.name,
        spec,
        status: ProjectStatus::Idle,
        provider: req.provider,
        provider_settings: BTreeMap::new(),
        model: req.model,
        concurrency: req.concurrency,
        use_agent_teams: false,
        system_prompt: None,
        review_before_coding: None,
        project_dir,
        created_at: now,
        updated_at: now,
    };
    project.clamp_concurrency();
    state.orchestrator.persistence.save_project(&project)?;

    if let Ok(content) = std::fs::read_to_string(project.project_dir.join("feature_list.json")) {
        if let Ok(features) = crate::persistence::FeatureList::parse(&content) {
            state.orchestrator.persistence.save_features(&project.id, &features)?;
        }
    }
    Ok(Json(project))
}

/// Deleting a project must stop any running agents first (§4.8).
pub async fn delete_project(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<()> {
    state.orchestrator.stop_agent(&id).await?;
    state.orchestrator.persistence.delete_project(&id)?;
    Ok(())
}

pub async fn start_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<()> {
    state.orchestrator.start_agent(&id).await
}

pub async fn stop_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<()> {
    state.orchestrator.stop_agent(&id).await
}

#[derive(Debug, Deserialize)]
pub struct SystemPromptRequest {
    pub system_prompt: Option<String>,
}

pub async fn update_system_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SystemPromptRequest>,
) -> Result<Json<Project>> {
    let mut project = state.orchestrator.persistence.load_project(&id)?;
    project.system_prompt = req.system_prompt;
    project.updated_at = Utc::now();
    state.orchestrator.persistence.save_project(&project)?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct AppendSpecRequest {
    pub fragment: String,
}

pub async fn append_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AppendSpecRequest>,
) -> Result<()> {
    state.orchestrator.start_append_initializer(&id, &req.fragment).await
}

#[derive(Debug, Deserialize)]
pub struct ReviewFeaturesRequest {
    pub feature_ids: Vec<String>,
    pub instruction: String,
}

pub async fn review_features(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReviewFeaturesRequest>,
) -> Result<()> {
    state.orchestrator.start_review_session(&id, req.feature_ids, req.instruction).await
}

pub async fn confirm_review(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<()> {
    state.orchestrator.confirm_review(&id).await
}
