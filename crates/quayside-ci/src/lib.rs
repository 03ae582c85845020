//! Quayside CI - stage execution and pipeline orchestration
//!
//! Provides a pipeline orchestrator that:
//! - Runs the test suite against an ephemeral PostgreSQL with a cached
//!   dependency install
//! - Builds one image per platform natively and publishes a multi-platform
//!   manifest under the run's tags
//! - Scans every built image and publishes the reports
//! - Deploys the manifest digest to the configured environment
//! - Records every run in the ledger and audits the recorded trace

pub mod build;
pub mod cache;
pub mod concurrency;
pub mod database;
pub mod deploy;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod pipeline;
pub mod publish;
pub mod runner;
pub mod scan;
pub mod spec;
pub mod stage;
pub mod test_stage;

// Re-export key types
pub use build::{
    parse_build_metadata, parse_manifest_digest, run_matrix, BuildRequest, BuildxImageBuilder,
    ImageBuilder, MatrixOutcome, RegistryLogin,
};
pub use cache::DependencyCache;
pub use concurrency::{CancelToken, ConcurrencyGroups, GroupGuard};
pub use database::EphemeralDatabase;
pub use deploy::CommandDeployer;
pub use error::CiError;
pub use gate::{CiGate, GateVerdict};
pub use pipeline::{Pipeline, PipelineResult, StageBackends};
pub use publish::{HttpReportPublisher, ReportPublisher, StorePublisher};
pub use runner::{run_checked, CommandExecutor, CommandOutput, SystemExecutor};
pub use scan::{parse_trivy_report, ScanPolicy, TrivyScanner, VulnerabilityScanner};
pub use spec::RunSpec;
pub use stage::StageCommand;
pub use test_stage::{CommandTestSuite, TestSuite};
