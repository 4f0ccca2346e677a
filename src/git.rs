//! Git gateway: serialized `checkout`/`merge`/branch operations on a
//! project's working directory. Pure shell-outs; the caller ([`crate::gitlock`])
//! is responsible for serializing access per project.

use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict(String),
}

/// Check if directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn checkout(dir: &Path, branch: &str) -> Result<(), String> {
    let output = Command::new("git")
        .args(["checkout", branch])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git checkout failed: {e}"))?;
    if !output.status.success() {
        return Err(format!("git checkout {branch} failed: {}", String::from_utf8_lossy(&output.stderr)));
    }
    Ok(())
}

/// Create `branch` off the currently checked-out commit (if it doesn't
/// already exist) and check it out.
pub fn create_and_checkout_branch(dir: &Path, branch: &str) -> Result<(), String> {
    let output = Command::new("git")
        .args(["checkout", "-b", branch])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git checkout -b failed: {e}"))?;
    if output.status.success() {
        return Ok(());
    }
    // Branch may already exist from a prior attempt; fall back to a plain checkout.
    checkout(dir, branch)
}

/// Merge `branch` into the currently checked-out branch with `--no-ff`. On
/// conflict the merge is aborted and the feature is left un-marked — no
/// resolution is attempted.
pub fn merge_no_ff(dir: &Path, branch: &str) -> Result<MergeOutcome, String> {
    let output = Command::new("git")
        .args(["merge", "--no-ff", "--no-edit", branch])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git merge failed: {e}"))?;
    if output.status.success() {
        return Ok(MergeOutcome::Merged);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let _ = Command::new("git").args(["merge", "--abort"]).current_dir(dir).output();
    Ok(MergeOutcome::Conflict(stderr))
}

pub fn delete_branch(dir: &Path, branch: &str) -> Result<(), String> {
    let output = Command::new("git")
        .args(["branch", "-D", branch])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git branch -D failed: {e}"))?;
    if !output.status.success() {
        return Err(format!("git branch -D {branch} failed: {}", String::from_utf8_lossy(&output.stderr)));
    }
    Ok(())
}
