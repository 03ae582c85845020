//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans: [`run_span`] for instrumenting futures,
//!   `RunSpan` RAII guard for synchronous code
//! - Emission functions for run, stage and gate lifecycle events
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).
//! For JSON output, pass `--json` to the CLI.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // Now all tracing calls are automatically associated with run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// Span tagged with the run_id, for `tracing::Instrument::instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("quayside.run", run_id = %run_id)
}

/// Emit event: run started for a pipeline and trigger.
pub fn emit_run_started(run_id: &str, pipeline: &str, trigger: &str) {
    info!(event = "run.started", run_id = %run_id, pipeline = %pipeline, trigger = %trigger);
}

/// Emit event: run finished with duration, total events and final status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, status: &str) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        status = %status,
    );
}

/// Emit event: run cancelled because a newer run took its concurrency group.
pub fn emit_run_cancelled(run_id: &str, group: &str) {
    warn!(event = "run.cancelled", run_id = %run_id, group = %group);
}

/// Emit event: a single event appended to the run.
pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    info!(event = "run.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

pub fn emit_stage_started(run_id: &str, stage: &str) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage);
}

pub fn emit_stage_finished(run_id: &str, stage: &str, status: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_skipped(run_id: &str, stage: &str, reason: &str) {
    info!(event = "stage.skipped", run_id = %run_id, stage = %stage, reason = %reason);
}

/// Emit event: ordering audit over the recorded events completed.
pub fn emit_gate_evaluated(run_id: &str, violations: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        violations = violations,
        passed = passed,
    );
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
