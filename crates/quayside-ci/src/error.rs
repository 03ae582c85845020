//! Stage execution errors.

use quayside_core::QuaysideError;
use quayside_state::{Severity, StorageError};
use thiserror::Error;

/// Errors raised while executing a stage's work.
///
/// Any of these fails the stage it occurs in; the orchestrator records it
/// and skips the downstream stages.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    #[error("{stage} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        stage: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("database not ready after {attempts} attempt(s)")]
    DatabaseNotReady { attempts: u32 },

    #[error("build produced no usable output: {0}")]
    BuildOutput(String),

    #[error("build failed for {failed} of {total} platform(s): {details}")]
    MatrixFailed {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("cannot parse scanner output: {0}")]
    ScanParse(String),

    #[error("{count} finding(s) at or above {threshold}")]
    BlockingFindings { count: usize, threshold: Severity },

    #[error("report upload failed: {0}")]
    ReportUpload(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] QuaysideError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<quayside_core::ValidationError> for CiError {
    fn from(e: quayside_core::ValidationError) -> Self {
        CiError::Core(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_stage() {
        let err = CiError::CommandFailed {
            stage: "mix test".to_string(),
            exit_code: 2,
            stderr: "1 failure".to_string(),
        };
        assert_eq!(err.to_string(), "mix test exited with code 2: 1 failure");

        let err = CiError::BlockingFindings {
            count: 3,
            threshold: Severity::High,
        };
        assert_eq!(err.to_string(), "3 finding(s) at or above HIGH");
    }

    #[test]
    fn validation_errors_convert_through_core() {
        let err: CiError = quayside_core::ValidationError::EmptyBranch.into();
        assert!(matches!(
            err,
            CiError::Core(QuaysideError::Validation(_))
        ));
    }
}
