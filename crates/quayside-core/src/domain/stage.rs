//! Pipeline stages and their statuses.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The four pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Test,
    Build,
    SecurityScan,
    Deploy,
}

impl StageKind {
    /// All stages in execution order.
    pub const ALL: [StageKind; 4] = [
        StageKind::Test,
        StageKind::Build,
        StageKind::SecurityScan,
        StageKind::Deploy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Test => "test",
            StageKind::Build => "build",
            StageKind::SecurityScan => "security_scan",
            StageKind::Deploy => "deploy",
        }
    }

    /// Stages that must have succeeded before this one may run.
    pub fn upstream(&self) -> &'static [StageKind] {
        match self {
            StageKind::Test => &[],
            StageKind::Build => &[StageKind::Test],
            StageKind::SecurityScan => &[StageKind::Build],
            StageKind::Deploy => &[StageKind::Build, StageKind::SecurityScan],
        }
    }

    /// Upper bound on a single stage's wall-clock time when not configured.
    pub fn default_timeout(&self) -> Duration {
        match self {
            StageKind::Test => Duration::from_secs(30 * 60),
            StageKind::Build => Duration::from_secs(60 * 60),
            StageKind::SecurityScan => Duration::from_secs(15 * 60),
            StageKind::Deploy => Duration::from_secs(15 * 60),
        }
    }

    /// Parse from the snake_case name used in events and on the CLI.
    pub fn from_name(name: &str) -> Option<StageKind> {
        StageKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Legal edges: `Pending -> Running | Skipped`, `Running -> Succeeded | Failed`.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Pending, StageStatus::Skipped)
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Failed)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "stage", rename_all = "snake_case")]
pub enum SkipReason {
    /// The trigger event does not make this stage eligible.
    NotTriggered,
    /// A required upstream stage failed.
    UpstreamFailed(StageKind),
    /// A required upstream stage was skipped or never finished.
    UpstreamSkipped(StageKind),
    /// The run was superseded and cancelled.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotTriggered => f.write_str("not triggered"),
            SkipReason::UpstreamFailed(s) => write!(f, "upstream {s} failed"),
            SkipReason::UpstreamSkipped(s) => write!(f, "upstream {s} skipped"),
            SkipReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_in_dependency_order() {
        for (i, stage) in StageKind::ALL.iter().enumerate() {
            for up in stage.upstream() {
                let pos = StageKind::ALL.iter().position(|s| s == up).unwrap();
                assert!(pos < i, "{up} must precede {stage}");
            }
        }
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use StageStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Running.can_transition_to(Skipped));
        for terminal in [Succeeded, Failed, Skipped] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Succeeded, Failed, Skipped] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in StageKind::ALL {
            assert_eq!(StageKind::from_name(stage.name()), Some(stage));
        }
        assert_eq!(StageKind::from_name("lint"), None);
    }

    #[test]
    fn skip_reason_serializes_with_stage() {
        let json = serde_json::to_value(SkipReason::UpstreamFailed(StageKind::Test)).unwrap();
        assert_eq!(json, serde_json::json!({"reason": "upstream_failed", "stage": "test"}));
        let json = serde_json::to_value(SkipReason::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!({"reason": "cancelled"}));
    }
}
