//! Path sandbox: any user-supplied absolute path must resolve under the
//! user's home directory, `/tmp`, or the current process working directory.

use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn allowed_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = home_dir() {
        roots.push(home);
    }
    roots.push(PathBuf::from("/tmp"));
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    roots
}

/// True iff `realpath(p)` equals or descends from home, `/tmp`, or cwd.
pub fn is_path_safe(p: &Path) -> bool {
    let Ok(resolved) = std::fs::canonicalize(p) else {
        return false;
    };
    allowed_roots().iter().any(|root| {
        let Ok(root) = std::fs::canonicalize(root) else {
            return false;
        };
        resolved == root || resolved.starts_with(&root)
    })
}

/// Validate `p`, returning the canonicalized path on success.
pub fn check_path(p: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(p)
        .map_err(|e| OrchestratorError::UnsafePath(format!("{}: {e}", p.display())))?;
    if is_path_safe(&resolved) {
        Ok(resolved)
    } else {
        Err(OrchestratorError::UnsafePath(format!(
            "{} is outside the allowed roots",
            p.display()
        )))
    }
}

/// Validate `p` for project creation, where `p` itself (and possibly several
/// trailing components) does not exist on disk yet. Canonicalizes the
/// deepest existing ancestor, checks that ancestor against the sandbox, then
/// re-appends the not-yet-created suffix without resolving it.
pub fn check_path_for_create(p: &Path) -> Result<PathBuf> {
    if p.exists() {
        return check_path(p);
    }
    if !p.is_absolute() {
        return Err(OrchestratorError::UnsafePath(format!("{} is not an absolute path", p.display())));
    }

    let mut existing = p;
    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                suffix.push(existing.file_name().ok_or_else(|| {
                    OrchestratorError::UnsafePath(format!("{} has no creatable path segment", p.display()))
                })?);
                existing = parent;
                if existing.exists() {
                    break;
                }
            }
            _ => break,
        }
    }

    let resolved_existing = std::fs::canonicalize(existing)
        .map_err(|e| OrchestratorError::UnsafePath(format!("{}: {e}", existing.display())))?;
    if !is_path_safe(&resolved_existing) {
        return Err(OrchestratorError::UnsafePath(format!("{} is outside the allowed roots", p.display())));
    }

    let mut full = resolved_existing;
    for segment in suffix.into_iter().rev() {
        full.push(segment);
    }
    Ok(full)
}
