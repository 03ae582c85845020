//! Audit of a recorded run against the stage ordering rules.

use std::collections::{BTreeSet, HashSet};

use quayside_core::StageKind;
use quayside_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// False when a stage started out of order. Stage failures alone keep
    /// this true.
    pub ordering_ok: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Re-checks a run's recorded events.
pub struct CiGate;

impl CiGate {
    /// Evaluate a run's event trace.
    ///
    /// Gate rules:
    /// - Build starts only after Test succeeded
    /// - Security Scan starts only after Build succeeded
    /// - Deploy starts only after Build and Security Scan succeeded, and
    ///   only for a push to the primary branch
    /// - Pull requests never start a stage other than Test
    /// - Every started stage either succeeds or fails, unless the run was
    ///   cancelled
    /// - Any failed stage fails the gate
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut ordering = Vec::new();
        let mut failures = Vec::new();

        let mut pull_request = false;
        let mut on_primary = false;
        let mut cancelled = false;
        let mut started: BTreeSet<String> = BTreeSet::new();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();

        let stage_of = |event: &RunEvent| {
            event.payload["stage"]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        };

        for event in events {
            match event.kind.as_str() {
                "run_started" => {
                    pull_request = event.payload["pull_request"].as_bool().unwrap_or(false);
                    let branch = event.payload["branch"].as_str().unwrap_or("");
                    let primary = event.payload["primary_branch"].as_str().unwrap_or("main");
                    on_primary = !pull_request && branch == primary;
                }
                "run_cancelled" => cancelled = true,
                "stage_started" => {
                    let stage = stage_of(event);
                    if let Some(kind) = StageKind::from_name(&stage) {
                        for up in kind.upstream() {
                            if !succeeded.contains(up.name()) {
                                ordering.push(format!(
                                    "Stage '{}' started before '{}' succeeded",
                                    stage,
                                    up.name()
                                ));
                            }
                        }
                        if pull_request && kind != StageKind::Test {
                            ordering.push(format!("Stage '{}' started for a pull request", stage));
                        }
                        if kind == StageKind::Deploy && !pull_request && !on_primary {
                            ordering.push("Deploy started off the primary branch".to_string());
                        }
                    }
                    started.insert(stage);
                }
                "stage_succeeded" => {
                    let stage = stage_of(event);
                    finished.insert(stage.clone());
                    succeeded.insert(stage);
                }
                "stage_failed" => {
                    let stage = stage_of(event);
                    let error = event.payload["error"]
                        .as_str()
                        .unwrap_or("Unknown error")
                        .to_string();
                    failures.push(format!("Stage '{}' failed: {}", stage, error));
                    finished.insert(stage);
                }
                _ => {}
            }
        }

        if !cancelled {
            for stage in &started {
                if !finished.contains(stage) {
                    failures.push(format!("Stage '{}' was started but never finished", stage));
                }
            }
        }

        let ordering_ok = ordering.is_empty();
        let mut violations = ordering;
        violations.extend(failures);
        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            ordering_ok,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn ev(seq: u64, kind: &str, payload: Value) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    fn start(branch: &str, pr: bool) -> RunEvent {
        ev(
            1,
            "run_started",
            json!({"branch": branch, "pull_request": pr, "primary_branch": "main"}),
        )
    }

    fn stage(seq: u64, kind: &str, name: &str) -> RunEvent {
        ev(seq, kind, json!({ "stage": name }))
    }

    #[test]
    fn test_empty_events_passes() {
        let verdict = CiGate::evaluate(&[]);
        assert!(verdict.passed);
        assert!(verdict.ordering_ok);
    }

    #[test]
    fn full_main_run_passes() {
        let mut events = vec![start("main", false)];
        let mut seq = 2;
        for name in ["test", "build", "security_scan", "deploy"] {
            events.push(stage(seq, "stage_started", name));
            events.push(stage(seq + 1, "stage_succeeded", name));
            seq += 2;
        }
        let verdict = CiGate::evaluate(&events);
        assert!(verdict.passed, "{:?}", verdict.violations);
    }

    #[test]
    fn build_before_test_success_is_flagged() {
        let events = vec![
            start("main", false),
            stage(2, "stage_started", "test"),
            ev(3, "stage_failed", json!({"stage": "test", "error": "exit 2"})),
            stage(4, "stage_started", "build"),
            stage(5, "stage_succeeded", "build"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(!verdict.ordering_ok);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.contains("'build' started before 'test'")));
        assert!(verdict.violations.iter().any(|v| v.contains("exit 2")));
    }

    #[test]
    fn pull_request_and_off_primary_deploys_are_flagged() {
        let events = vec![
            start("feature/x", true),
            stage(2, "stage_started", "test"),
            stage(3, "stage_succeeded", "test"),
            stage(4, "stage_started", "build"),
            stage(5, "stage_succeeded", "build"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.contains("for a pull request")));

        let mut events = vec![start("develop", false)];
        for (i, name) in ["test", "build", "security_scan", "deploy"].iter().enumerate() {
            events.push(stage(2 + 2 * i as u64, "stage_started", name));
            events.push(stage(3 + 2 * i as u64, "stage_succeeded", name));
        }
        let verdict = CiGate::evaluate(&events);
        assert!(verdict
            .violations
            .contains(&"Deploy started off the primary branch".to_string()));
    }

    #[test]
    fn failure_alone_keeps_ordering_ok() {
        let events = vec![
            start("main", false),
            stage(2, "stage_started", "test"),
            ev(3, "stage_failed", json!({"stage": "test", "error": "1 failure"})),
            stage(4, "stage_skipped", "build"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.ordering_ok);
        assert_eq!(verdict.violations.len(), 1);
    }

    #[test]
    fn unfinished_stage_only_flagged_without_cancellation() {
        let events = vec![start("main", false), stage(2, "stage_started", "test")];
        let verdict = CiGate::evaluate(&events);
        assert!(verdict.violations[0].contains("never finished"));

        let mut cancelled = events.clone();
        cancelled.push(ev(3, "run_cancelled", json!({})));
        assert!(CiGate::evaluate(&cancelled).passed);
    }
}
