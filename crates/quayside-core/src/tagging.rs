//! Deterministic image tags from branch name and commit SHA.
//!
//! | branch            | tags                                  |
//! |-------------------|---------------------------------------|
//! | primary (`main`)  | `latest`, `main`, `main-<sha7>`       |
//! | other build branch| `develop`, `develop-<sha7>`           |
//! | anything else     | `<branch>-<sha7>`                     |
//!
//! The traceable `<branch>-<sha7>` tag is always present and always last.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::ValidationError;
use crate::trigger_gate::GatePolicy;

/// Longest tag the OCI distribution spec accepts.
pub const MAX_TAG_LEN: usize = 128;

/// Length of the abbreviated commit SHA used in tags.
pub const SHORT_SHA_LEN: usize = 7;

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"))
}

/// Whether `tag` matches the OCI tag grammar.
pub fn is_valid_tag(tag: &str) -> bool {
    tag_regex().is_match(tag)
}

/// Abbreviate a commit SHA to its first seven hex characters, lowercased.
pub fn short_sha(sha: &str) -> Result<String, ValidationError> {
    let sha = sha.trim();
    if sha.len() < SHORT_SHA_LEN || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidCommitSha {
            sha: sha.to_string(),
        });
    }
    Ok(sha[..SHORT_SHA_LEN].to_ascii_lowercase())
}

/// Map a branch name onto the tag grammar.
///
/// Characters outside `[A-Za-z0-9_.-]` become `-`, leading `.`/`-` are
/// dropped and the result is truncated so `<branch>-<sha7>` still fits.
pub fn sanitize_branch(branch: &str) -> Result<String, ValidationError> {
    let replaced: String = branch
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = replaced.trim_start_matches(['.', '-']);
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyBranch);
    }
    let max = MAX_TAG_LEN - SHORT_SHA_LEN - 1;
    Ok(trimmed.chars().take(max).collect())
}

/// Derive every tag for a build of `branch` at `commit_sha`.
pub fn derive_tags(
    branch: &str,
    commit_sha: &str,
    policy: &GatePolicy,
) -> Result<Vec<String>, ValidationError> {
    let sha7 = short_sha(commit_sha)?;
    let slug = sanitize_branch(branch)?;

    let mut tags = Vec::with_capacity(3);
    if branch == policy.primary_branch {
        tags.push("latest".to_string());
    }
    if policy.is_build_branch(branch) {
        tags.push(slug.clone());
    }
    tags.push(format!("{slug}-{sha7}"));

    if let Some(bad) = tags.iter().find(|t| !is_valid_tag(t)) {
        return Err(ValidationError::InvalidTag { tag: bad.clone() });
    }
    Ok(tags)
}
