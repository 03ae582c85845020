//! Quayside Core Library
//!
//! Domain model and policy for the Test -> Build -> Security Scan -> Deploy
//! pipeline: trigger gating, tag derivation, idempotent deployment, run
//! recording and the fixed error views. Stage execution lives in
//! `quayside-ci`.

pub mod config;
pub mod deploy;
pub mod domain;
pub mod error_view;
pub mod git;
pub mod metrics;
pub mod obs;
pub mod recording;
pub mod reporting;
pub mod tagging;
pub mod telemetry;
pub mod trigger_gate;

pub use config::{
    BuildConfig, ConcurrencyConfig, DatabaseConfig, DeployConfig, PipelineConfig, RegistryConfig,
    ScanConfig, TestConfig, DEFAULT_CONFIG_FILE,
};
pub use deploy::{deploy_image, rollback, DeployOutcome, DeployTarget, Deployer};
pub use domain::{
    BuiltImage, Event, EventKind, ImageManifest, ImageRef, PipelineRun, Platform, QuaysideError,
    Result, SkipReason, StageKind, StageResult, StageStatus, TriggerEvent, ValidationError,
};
pub use git::{capture_head_sha, current_branch, is_git_repo};
pub use metrics::METRICS;
pub use recording::RunRecorder;
pub use reporting::{
    render_run_summary_md, write_run_summary_json, write_run_summary_md, RunSummaryArtifact,
    ScanSummaryArtifact,
};
pub use tagging::{derive_tags, is_valid_tag, sanitize_branch, short_sha};
pub use telemetry::init_tracing;
pub use trigger_gate::{Eligibility, GatePolicy, StagePlan, TriggerGate};
