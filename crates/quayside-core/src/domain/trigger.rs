//! Source-control events that start a pipeline run.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// A push to a branch or a pull-request open/update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        branch: String,
    },
    PullRequest {
        number: u64,
        head_branch: String,
        base_branch: String,
    },
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        TriggerEvent::Push {
            branch: branch.into(),
        }
    }

    pub fn pull_request(
        number: u64,
        head_branch: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        TriggerEvent::PullRequest {
            number,
            head_branch: head_branch.into(),
            base_branch: base_branch.into(),
        }
    }

    /// Branch whose code is under test (the head branch for pull requests).
    pub fn branch(&self) -> &str {
        match self {
            TriggerEvent::Push { branch } => branch,
            TriggerEvent::PullRequest { head_branch, .. } => head_branch,
        }
    }

    pub fn is_pull_request(&self) -> bool {
        matches!(self, TriggerEvent::PullRequest { .. })
    }

    /// Whether this is a push to exactly `branch`.
    pub fn is_push_to(&self, branch: &str) -> bool {
        matches!(self, TriggerEvent::Push { branch: b } if b == branch)
    }

    /// Short event kind, as used in run metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => "push",
            TriggerEvent::PullRequest { .. } => "pull_request",
        }
    }

    /// Resolve the event from GitHub Actions variables.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`. Reads
    /// `GITHUB_EVENT_NAME`, then `GITHUB_REF_NAME` for pushes or
    /// `GITHUB_HEAD_REF` / `GITHUB_BASE_REF` / `GITHUB_REF` for pull requests.
    pub fn from_github_env<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |var: &str| {
            lookup(var)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ValidationError::MissingEnv {
                    var: var.to_string(),
                })
        };

        let name = require("GITHUB_EVENT_NAME")?;
        match name.as_str() {
            "push" => Ok(TriggerEvent::push(require("GITHUB_REF_NAME")?)),
            "pull_request" | "pull_request_target" => {
                // refs/pull/<number>/merge
                let number = lookup("GITHUB_REF")
                    .and_then(|r| {
                        r.strip_prefix("refs/pull/")
                            .and_then(|rest| rest.split('/').next())
                            .and_then(|n| n.parse().ok())
                    })
                    .unwrap_or(0);
                Ok(TriggerEvent::pull_request(
                    number,
                    require("GITHUB_HEAD_REF")?,
                    require("GITHUB_BASE_REF")?,
                ))
            }
            other => Err(ValidationError::UnknownEvent {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::Push { branch } => write!(f, "push:{branch}"),
            TriggerEvent::PullRequest {
                number,
                head_branch,
                base_branch,
            } => write!(f, "pull_request:{number} ({head_branch} -> {base_branch})"),
        }
    }
}
