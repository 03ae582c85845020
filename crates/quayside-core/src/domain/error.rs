//! Domain-level error taxonomy for Quayside.

use quayside_state::StorageError;

/// Errors produced while parsing or validating pipeline inputs.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid image reference '{value}': {reason}")]
    InvalidImageRef { value: String, reason: String },

    #[error("invalid image tag: {tag}")]
    InvalidTag { tag: String },

    #[error("invalid commit sha: {sha}")]
    InvalidCommitSha { sha: String },

    #[error("branch name must not be empty")]
    EmptyBranch,

    #[error("unknown trigger event: {name}")]
    UnknownEvent { name: String },

    #[error("missing environment variable: {var}")]
    MissingEnv { var: String },

    #[error("no error view for template: {template}")]
    UnknownTemplate { template: String },
}

/// Quayside domain errors.
#[derive(Debug, thiserror::Error)]
pub enum QuaysideError {
    #[error("pipeline invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("deployment failed: {0}")]
    Deploy(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Quayside domain operations.
pub type Result<T> = std::result::Result<T, QuaysideError>;
