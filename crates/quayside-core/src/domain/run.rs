//! Pipeline runs, stage results and the run event trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{QuaysideError, Result};
use super::image::{BuiltImage, ImageManifest};
use super::stage::{SkipReason, StageKind, StageStatus};
use super::trigger::TriggerEvent;

/// Outcome of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// Set only when `status` is `Skipped`.
    pub skip_reason: Option<SkipReason>,
    pub logs: Vec<String>,
    /// Per-platform images (Build only).
    pub images: Vec<BuiltImage>,
    /// Published multi-platform manifest (Build only).
    pub manifest: Option<ImageManifest>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    fn pending(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            skip_reason: None,
            logs: Vec::new(),
            images: Vec::new(),
            manifest: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock time between start and finish, if both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// A single execution of the pipeline for one commit and trigger event.
///
/// Owns one [`StageResult`] per [`StageKind`]; every status change goes
/// through [`PipelineRun::transition`], which refuses changes that would
/// break the stage ordering rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub commit_sha: String,
    pub event: TriggerEvent,
    /// Only pushes to this branch may deploy.
    pub primary_branch: String,
    pub stages: Vec<StageResult>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        commit_sha: impl Into<String>,
        event: TriggerEvent,
        primary_branch: impl Into<String>,
    ) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            event,
            primary_branch: primary_branch.into(),
            stages: StageKind::ALL.into_iter().map(StageResult::pending).collect(),
            started_at: Utc::now(),
        }
    }

    pub fn stage(&self, kind: StageKind) -> &StageResult {
        // Constructed with every kind in `StageKind::ALL` order.
        &self.stages[kind as usize]
    }

    fn stage_mut(&mut self, kind: StageKind) -> &mut StageResult {
        &mut self.stages[kind as usize]
    }

    pub fn status(&self, kind: StageKind) -> StageStatus {
        self.stage(kind).status
    }

    /// Move a stage to `next`, enforcing the run invariants.
    pub fn transition(&mut self, kind: StageKind, next: StageStatus) -> Result<()> {
        let current = self.status(kind);
        if !current.can_transition_to(next) {
            return Err(QuaysideError::InvariantViolation(format!(
                "{kind}: illegal transition {current} -> {next}"
            )));
        }
        if next == StageStatus::Skipped {
            return Err(QuaysideError::InvariantViolation(format!(
                "{kind}: use skip() to record a skip reason"
            )));
        }

        if next == StageStatus::Running {
            self.check_upstream(kind)?;
            if kind == StageKind::Deploy && !self.event.is_push_to(&self.primary_branch) {
                return Err(QuaysideError::InvariantViolation(format!(
                    "deploy cannot run for {}",
                    self.event
                )));
            }
        }
        if next == StageStatus::Succeeded && kind == StageKind::Deploy {
            self.check_upstream(kind)?;
        }

        let now = Utc::now();
        let stage = self.stage_mut(kind);
        stage.status = next;
        match next {
            StageStatus::Running => stage.started_at = Some(now),
            _ => stage.finished_at = Some(now),
        }
        Ok(())
    }

    /// Mark a pending stage as not attempted.
    pub fn skip(&mut self, kind: StageKind, reason: SkipReason) -> Result<()> {
        let current = self.status(kind);
        if !current.can_transition_to(StageStatus::Skipped) {
            return Err(QuaysideError::InvariantViolation(format!(
                "{kind}: cannot skip a stage that is {current}"
            )));
        }
        let stage = self.stage_mut(kind);
        stage.status = StageStatus::Skipped;
        stage.skip_reason = Some(reason);
        stage.finished_at = Some(Utc::now());
        Ok(())
    }

    fn check_upstream(&self, kind: StageKind) -> Result<()> {
        for up in kind.upstream() {
            let status = self.status(*up);
            if status != StageStatus::Succeeded {
                return Err(QuaysideError::InvariantViolation(format!(
                    "{kind} requires {up} to have succeeded, but it is {status}"
                )));
            }
        }
        Ok(())
    }

    pub fn append_log(&mut self, kind: StageKind, line: impl Into<String>) {
        self.stage_mut(kind).logs.push(line.into());
    }

    pub fn attach_images(&mut self, images: Vec<BuiltImage>) {
        self.stage_mut(StageKind::Build).images.extend(images);
    }

    pub fn attach_manifest(&mut self, manifest: ImageManifest) {
        self.stage_mut(StageKind::Build).manifest = Some(manifest);
    }

    /// Published manifest of this run's Build stage, if any.
    pub fn manifest(&self) -> Option<&ImageManifest> {
        self.stage(StageKind::Build).manifest.as_ref()
    }

    /// True when no stage failed and none was cancelled.
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| {
            s.status != StageStatus::Failed && s.skip_reason != Some(SkipReason::Cancelled)
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.skip_reason == Some(SkipReason::Cancelled))
    }

    /// Whether every stage reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_terminal())
    }
}

/// Classification of an event in a run's trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Run accepted and planned.
    RunStarted,

    /// Run superseded by a newer run in the same concurrency group.
    RunCancelled,

    StageStarted { stage: StageKind },

    StageSucceeded { stage: StageKind },

    StageFailed { stage: StageKind },

    StageSkipped { stage: StageKind },

    /// One platform image pushed by the build matrix.
    ImagePushed { platform: String },

    /// Multi-platform manifest published under the run's tags.
    ManifestPublished,

    /// Vulnerability report published for an image digest.
    ReportPublished { image_digest: String },

    /// New deployment applied to an environment.
    Deployed { environment: String },

    /// Environment already ran the image; nothing applied.
    DeploySkippedCurrent { environment: String },
}

impl EventKind {
    /// Snake_case kind string, taken from the serde tag.
    pub fn as_kind_str(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A single event in a run's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing sequence number within the run.
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,

    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(seq: u64, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_push() -> PipelineRun {
        PipelineRun::new("1a2b3c4d5e6f", TriggerEvent::push("main"), "main")
    }

    fn succeed(run: &mut PipelineRun, kind: StageKind) {
        run.transition(kind, StageStatus::Running).unwrap();
        run.transition(kind, StageStatus::Succeeded).unwrap();
    }

    #[test]
    fn new_run_has_all_stages_pending() {
        let run = main_push();
        assert_eq!(run.stages.len(), 4);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(run.stage(StageKind::SecurityScan).stage, StageKind::SecurityScan);
    }

    #[test]
    fn build_requires_test_success() {
        let mut run = main_push();
        let err = run
            .transition(StageKind::Build, StageStatus::Running)
            .unwrap_err();
        assert!(matches!(err, QuaysideError::InvariantViolation(_)));

        run.transition(StageKind::Test, StageStatus::Running).unwrap();
        run.transition(StageKind::Test, StageStatus::Failed).unwrap();
        assert!(run.transition(StageKind::Build, StageStatus::Running).is_err());
        assert!(!run.succeeded());
    }

    #[test]
    fn deploy_requires_build_and_scan() {
        let mut run = main_push();
        succeed(&mut run, StageKind::Test);
        succeed(&mut run, StageKind::Build);
        assert!(run.transition(StageKind::Deploy, StageStatus::Running).is_err());

        succeed(&mut run, StageKind::SecurityScan);
        succeed(&mut run, StageKind::Deploy);
        assert!(run.is_finished());
        assert!(run.succeeded());
    }

    #[test]
    fn deploy_refused_off_primary_branch() {
        let mut run = PipelineRun::new("abc1234", TriggerEvent::push("develop"), "main");
        succeed(&mut run, StageKind::Test);
        succeed(&mut run, StageKind::Build);
        succeed(&mut run, StageKind::SecurityScan);
        assert!(run.transition(StageKind::Deploy, StageStatus::Running).is_err());

        let mut pr = PipelineRun::new(
            "abc1234",
            TriggerEvent::pull_request(7, "main", "main"),
            "main",
        );
        succeed(&mut pr, StageKind::Test);
        succeed(&mut pr, StageKind::Build);
        succeed(&mut pr, StageKind::SecurityScan);
        assert!(pr.transition(StageKind::Deploy, StageStatus::Running).is_err());
    }

    #[test]
    fn terminal_statuses_are_immutable() {
        let mut run = main_push();
        succeed(&mut run, StageKind::Test);
        assert!(run.transition(StageKind::Test, StageStatus::Failed).is_err());
        assert!(run.transition(StageKind::Test, StageStatus::Running).is_err());
        assert!(run.skip(StageKind::Test, SkipReason::Cancelled).is_err());
    }

    #[test]
    fn skip_records_reason_and_blocks_running() {
        let mut run = main_push();
        run.skip(StageKind::Deploy, SkipReason::Cancelled).unwrap();
        let deploy = run.stage(StageKind::Deploy);
        assert_eq!(deploy.status, StageStatus::Skipped);
        assert_eq!(deploy.skip_reason, Some(SkipReason::Cancelled));
        assert!(run.was_cancelled());
        assert!(!run.succeeded());
        assert!(run.transition(StageKind::Test, StageStatus::Skipped).is_err());
    }

    #[test]
    fn event_kind_str_uses_serde_tag() {
        assert_eq!(EventKind::RunStarted.as_kind_str(), "run_started");
        assert_eq!(
            EventKind::StageFailed {
                stage: StageKind::SecurityScan
            }
            .as_kind_str(),
            "stage_failed"
        );
        assert_eq!(
            EventKind::DeploySkippedCurrent {
                environment: "production".to_string()
            }
            .as_kind_str(),
            "deploy_skipped_current"
        );
    }
}
