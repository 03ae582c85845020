//! Git integration utilities for resolving the commit under test.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{QuaysideError, Result};

fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| QuaysideError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(QuaysideError::Git(format!(
            "git {} failed: {stderr}",
            args.join(" ")
        )));
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(QuaysideError::Git(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(value)
}

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    git_output(repo_dir, &["rev-parse", "HEAD"])
}

/// Name of the checked-out branch (`HEAD` when detached).
pub fn current_branch(repo_dir: &Path) -> Result<String> {
    git_output(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
