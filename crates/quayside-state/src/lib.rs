//! Quayside-State: persistence layer for the Quayside pipeline
//!
//! Everything the pipeline remembers between runs lives behind the traits in
//! [`storage_traits`]: the run ledger, the vulnerability-report surface and
//! the per-environment deployment registry.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Two backends implement every trait:
//!
//! - SurrealDB (`SurrealRunLedger`, `SurrealReportStore`,
//!   `SurrealDeploymentRegistry`) sharing a single [`StoreHandle`]
//! - In-memory fakes in [`fakes`] for tests and dry runs

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_deployments;
pub mod surreal_ledger;
pub mod surreal_reports;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, StoreHandle, DEFAULT_LOCAL_DIR};
pub use storage_traits::{
    ContentDigest, DeploymentMetadata, DeploymentRecord, DeploymentRegistry, Finding,
    ImageDigest, ReportStore, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus,
    RunSummary, Severity, StorageResult, VulnerabilityReport,
};
pub use surreal_deployments::SurrealDeploymentRegistry;
pub use surreal_ledger::SurrealRunLedger;
pub use surreal_reports::SurrealReportStore;

/// Result type for quayside-state operations
pub type Result<T> = std::result::Result<T, StateError>;
