//! Domain models for Quayside.
//!
//! Canonical definitions for the core entities:
//! - `PipelineRun`: one execution for a commit and trigger event
//! - `StageResult`: outcome of Test, Build, Security Scan or Deploy
//! - `ImageRef` / `BuiltImage` / `ImageManifest`: build outputs
//! - `TriggerEvent`: push or pull request

pub mod error;
pub mod image;
pub mod run;
pub mod stage;
pub mod trigger;

// Re-export main types and errors
pub use error::{QuaysideError, Result, ValidationError};
pub use image::{BuiltImage, ImageManifest, ImageRef, Platform};
pub use run::{Event, EventKind, PipelineRun, StageResult};
pub use stage::{SkipReason, StageKind, StageStatus};
pub use trigger::TriggerEvent;
