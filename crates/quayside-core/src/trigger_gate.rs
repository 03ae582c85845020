//! Stage eligibility per trigger event.
//!
//! The gate is pure: it inspects the event and the run's current stage
//! statuses and answers whether a stage may start. It never mutates the run.

use serde::{Deserialize, Serialize};

use crate::domain::{PipelineRun, SkipReason, StageKind, StageStatus, TriggerEvent};

/// Branch rules for building and deploying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// Only pushes here deploy; builds here are also tagged `latest`.
    pub primary_branch: String,
    /// Pushes to these branches build, scan and get a branch-name tag.
    pub build_branches: Vec<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            primary_branch: "main".to_string(),
            build_branches: vec!["main".to_string(), "develop".to_string()],
        }
    }
}

impl GatePolicy {
    pub fn is_build_branch(&self, branch: &str) -> bool {
        self.build_branches.iter().any(|b| b == branch)
    }
}

/// Stages the event makes eligible, before any stage has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub planned: Vec<StageKind>,
}

impl StagePlan {
    pub fn includes(&self, stage: StageKind) -> bool {
        self.planned.contains(&stage)
    }
}

/// Answer for a stage about to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Eligibility {
    Eligible,
    Skip(SkipReason),
}

/// Decides which stages run for a trigger event.
#[derive(Debug, Clone, Default)]
pub struct TriggerGate {
    policy: GatePolicy,
}

impl TriggerGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Static eligibility:
    /// - Test: always
    /// - Build: push to a build branch
    /// - Security Scan: whenever Build is planned
    /// - Deploy: push to the primary branch
    pub fn plan(&self, event: &TriggerEvent) -> StagePlan {
        let mut planned = vec![StageKind::Test];
        let builds = match event {
            TriggerEvent::Push { branch } => self.policy.is_build_branch(branch),
            TriggerEvent::PullRequest { .. } => false,
        };
        if builds {
            planned.push(StageKind::Build);
            planned.push(StageKind::SecurityScan);
        }
        if builds && event.is_push_to(&self.policy.primary_branch) {
            planned.push(StageKind::Deploy);
        }
        StagePlan { planned }
    }

    /// Dynamic check at stage start against the run's upstream results.
    pub fn eligibility(
        &self,
        stage: StageKind,
        event: &TriggerEvent,
        run: &PipelineRun,
    ) -> Eligibility {
        if !self.plan(event).includes(stage) {
            return Eligibility::Skip(SkipReason::NotTriggered);
        }
        for up in stage.upstream() {
            match run.status(*up) {
                StageStatus::Succeeded => {}
                StageStatus::Failed => return Eligibility::Skip(SkipReason::UpstreamFailed(*up)),
                _ => return Eligibility::Skip(SkipReason::UpstreamSkipped(*up)),
            }
        }
        Eligibility::Eligible
    }
}
