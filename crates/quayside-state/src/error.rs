//! Error types for quayside-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run ID is unknown to the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Operation requires a different run status
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// No scan report stored for the image digest
    #[error("no scan report for image {digest}")]
    ReportNotFound { digest: String },

    /// Environment has never been deployed
    #[error("no deployment recorded for environment '{environment}'")]
    DeploymentNotFound { environment: String },

    /// Rollback requested with a single deployment in history
    #[error("environment '{environment}' has no previous deployment to roll back to")]
    NoPreviousDeployment { environment: String },

    /// Malformed content digest
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend failure (query, serialization, connection)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
