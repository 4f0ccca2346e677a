//! Crate-wide error taxonomy. The orchestrator never panics on a child's
//! output; parse and git failures are recoverable and handled inline where
//! they occur. This enum exists for the subset of failures that must be
//! reported to a caller or surfaced as a broadcast.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsafe path: {0}")]
    UnsafePath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent already running for this project")]
    AlreadyRunning,

    #[error("failed to spawn child process: {0}")]
    SpawnFailure(String),

    #[error("git operation failed: {0}")]
    GitFailure(String),

    #[error("fatal orchestrator error: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),

    #[error("claim error: {0}")]
    Claim(#[from] crate::claims::ClaimError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
