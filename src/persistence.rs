//! Durable per-project storage: project record, cached feature list, session
//! records, append-only log stream, and the help-request queue.
//!
//! Layout under `<dataDir>`:
//! ```text
//! projects/<projectId>/project.json
//!                      features.json
//!                      sessions.json
//!                      logs.jsonl
//!                      claimed.json
//!                      help-requests.json
//! claude-logs/<sessionId>.log
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::state::ProjectStatus;

const LOG_CAP: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub spec: String,
    pub status: ProjectStatus,
    pub provider: String,
    #[serde(default)]
    pub provider_settings: BTreeMap<String, serde_json::Value>,
    pub model: String,
    pub concurrency: u32,
    #[serde(default)]
    pub use_agent_teams: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub review_before_coding: Option<bool>,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Clamp concurrency into `[1, 8]` per the data-model invariant.
    pub fn clamp_concurrency(&mut self) {
        self.concurrency = self.concurrency.clamp(1, 8);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default)]
    pub fail_count: Option<u32>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// `feature_list.json` may be a bare array or `{ "features": [...] }`; both
/// forms round-trip through this wrapper, which always serializes as the
/// bare-array form for the cache copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureList {
    pub features: Vec<Feature>,
}

impl FeatureList {
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        if let Ok(features) = serde_json::from_str::<Vec<Feature>>(content) {
            return Ok(FeatureList { features });
        }
        serde_json::from_str::<FeatureList>(content)
    }

    pub fn all_done(&self) -> bool {
        !self.features.is_empty() && self.features.iter().all(|f| f.passes)
    }

    pub fn counts(&self) -> (usize, usize) {
        let total = self.features.len();
        let passed = self.features.iter().filter(|f| f.passes).count();
        (total, passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Initializer,
    Coding,
    AgentTeams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    #[serde(default)]
    pub agent_index: Option<u32>,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Assistant,
    ToolUse,
    ToolResult,
    Thinking,
    System,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub content: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub agent_index: Option<u32>,
    #[serde(default)]
    pub temporary: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelpRequestStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureContext {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelpRequest {
    pub id: String,
    pub project_id: String,
    pub session_id: String,
    pub agent_index: u32,
    pub message: String,
    pub status: HelpRequestStatus,
    #[serde(default)]
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feature_context: Option<FeatureContext>,
    #[serde(default)]
    pub log_snapshot: Option<Vec<LogEntry>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Filesystem-backed store rooted at a single data directory.
#[derive(Debug, Clone)]
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("projects").join(project_id)
    }

    pub fn claude_logs_dir(&self) -> PathBuf {
        self.data_dir.join("claude-logs")
    }

    pub fn raw_log_path(&self, session_id: &str) -> PathBuf {
        self.claude_logs_dir().join(format!("{session_id}.log"))
    }

    fn ensure_project_dir(&self, project_id: &str) -> Result<PathBuf> {
        let dir = self.project_dir(project_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    // --- project.json ---

    pub fn save_project(&self, project: &Project) -> Result<()> {
        let dir = self.ensure_project_dir(&project.id)?;
        Self::write_json_pretty(&dir.join("project.json"), project)
    }

    pub fn load_project(&self, project_id: &str) -> Result<Project> {
        let path = self.project_dir(project_id).join("project.json");
        if !path.exists() {
            return Err(PersistenceError::NotFound(project_id.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let root = self.data_dir.join("projects");
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut projects = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let project_json = entry.path().join("project.json");
            if project_json.exists() {
                let content = std::fs::read_to_string(project_json)?;
                projects.push(serde_json::from_str(&content)?);
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    pub fn delete_project(&self, project_id: &str) -> Result<()> {
        let dir = self.project_dir(project_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    // --- features.json (persistence cache) ---

    pub fn save_features(&self, project_id: &str, features: &FeatureList) -> Result<()> {
        let dir = self.ensure_project_dir(project_id)?;
        Self::write_json_pretty(&dir.join("features.json"), features)
    }

    pub fn load_features(&self, project_id: &str) -> Result<FeatureList> {
        let path = self.project_dir(project_id).join("features.json");
        if !path.exists() {
            return Ok(FeatureList::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(FeatureList::parse(&content)?)
    }

    // --- sessions.json ---

    pub fn save_sessions(&self, project_id: &str, sessions: &[Session]) -> Result<()> {
        let dir = self.ensure_project_dir(project_id)?;
        Self::write_json_pretty(&dir.join("sessions.json"), sessions)
    }

    pub fn load_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        let path = self.project_dir(project_id).join("sessions.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.load_sessions(&session.project_id)?;
        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session.clone();
        } else {
            sessions.push(session.clone());
        }
        self.save_sessions(&session.project_id, &sessions)
    }

    // --- logs.jsonl ---

    fn logs_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("logs.jsonl")
    }

    fn legacy_logs_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("logs.json")
    }

    /// One-time migration: if a legacy single-array `logs.json` exists,
    /// rewrite it as append-only `logs.jsonl` and remove the legacy file.
    /// Idempotent: running it twice with no legacy file is a no-op.
    pub fn migrate_legacy_logs(&self, project_id: &str) -> Result<()> {
        let legacy = self.legacy_logs_path(project_id);
        if !legacy.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&legacy)?;
        let entries: Vec<LogEntry> = serde_json::from_str(&content).unwrap_or_default();
        let jsonl_path = self.logs_path(project_id);
        self.ensure_project_dir(project_id)?;
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        std::fs::write(&jsonl_path, out)?;
        std::fs::remove_file(&legacy)?;
        Ok(())
    }

    /// Append one entry to `logs.jsonl`. `thinking` entries are never
    /// persisted — callers must filter those out before calling this.
    pub fn append_log(&self, project_id: &str, entry: &LogEntry) -> Result<()> {
        use std::io::Write;
        self.migrate_legacy_logs(project_id)?;
        self.ensure_project_dir(project_id)?;
        let path = self.logs_path(project_id);
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Read all log entries, truncating to the last `LOG_CAP` on disk if the
    /// file has grown past the cap. Malformed lines are silently skipped.
    pub fn read_logs(&self, project_id: &str) -> Result<Vec<LogEntry>> {
        self.migrate_legacy_logs(project_id)?;
        let path = self.logs_path(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut entries: Vec<LogEntry> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        if entries.len() > LOG_CAP {
            entries = entries.split_off(entries.len() - LOG_CAP);
            let mut out = String::new();
            for entry in &entries {
                out.push_str(&serde_json::to_string(entry)?);
                out.push('\n');
            }
            std::fs::write(&path, out)?;
        }
        Ok(entries)
    }

    // --- help-requests.json ---

    pub fn save_help_requests(&self, project_id: &str, requests: &[HelpRequest]) -> Result<()> {
        let dir = self.ensure_project_dir(project_id)?;
        Self::write_json_pretty(&dir.join("help-requests.json"), requests)
    }

    pub fn load_help_requests(&self, project_id: &str) -> Result<Vec<HelpRequest>> {
        let path = self.project_dir(project_id).join("help-requests.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn add_help_request(&self, request: &HelpRequest) -> Result<()> {
        let mut requests = self.load_help_requests(&request.project_id)?;
        requests.push(request.clone());
        self.save_help_requests(&request.project_id, &requests)
    }

    pub fn resolve_help_request(
        &self,
        project_id: &str,
        request_id: &str,
        response: String,
        resolved_at: DateTime<Utc>,
    ) -> Result<HelpRequest> {
        let mut requests = self.load_help_requests(project_id)?;
        let request = requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or_else(|| PersistenceError::NotFound(request_id.to_string()))?;
        request.status = HelpRequestStatus::Resolved;
        request.response = Some(response);
        request.resolved_at = Some(resolved_at);
        let resolved = request.clone();
        self.save_help_requests(project_id, &requests)?;
        Ok(resolved)
    }

    // --- claimed.json (optional snapshot; the claim table is authoritative in-memory) ---

    pub fn save_claims_snapshot(
        &self,
        project_id: &str,
        claims: &BTreeMap<String, u32>,
    ) -> Result<()> {
        let dir = self.ensure_project_dir(project_id)?;
        Self::write_json_pretty(&dir.join("claimed.json"), claims)
    }
}
