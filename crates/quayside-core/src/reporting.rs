use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quayside_state::{Severity, VulnerabilityReport};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::{PipelineRun, StageStatus};

/// One row of the stage table in run_summary.md.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummaryArtifact {
    pub stage: String,
    pub status: String,
    pub detail: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Finding counts for one scanned image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSummaryArtifact {
    pub image_digest: String,
    pub image_ref: String,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub unknown: usize,
}

impl ScanSummaryArtifact {
    pub fn from_report(report: &VulnerabilityReport) -> Self {
        Self {
            image_digest: report.image_digest.to_string(),
            image_ref: report.image_ref.clone(),
            critical: report.count(Severity::Critical),
            high: report.count(Severity::High),
            medium: report.count(Severity::Medium),
            low: report.count(Severity::Low),
            unknown: report.count(Severity::Unknown),
        }
    }
}

/// Canonical run summary written for CI step summaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummaryArtifact {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub commit_sha: String,
    pub trigger: String,
    pub success: bool,
    pub stages: Vec<StageSummaryArtifact>,
    pub tags: Vec<String>,
    pub manifest_digest: Option<String>,
    pub scans: Vec<ScanSummaryArtifact>,
}

impl RunSummaryArtifact {
    pub fn from_run(run_id: &str, run: &PipelineRun, reports: &[VulnerabilityReport]) -> Self {
        let stages = run
            .stages
            .iter()
            .map(|s| StageSummaryArtifact {
                stage: s.stage.to_string(),
                status: s.status.to_string(),
                detail: match s.status {
                    StageStatus::Skipped => s.skip_reason.as_ref().map(|r| r.to_string()),
                    StageStatus::Failed => s.logs.last().cloned(),
                    _ => None,
                },
                duration_ms: s.duration_ms(),
            })
            .collect();

        let manifest = run.manifest();
        Self {
            schema_version: "1.0".to_string(),
            generated_at: Utc::now(),
            run_id: run_id.to_string(),
            commit_sha: run.commit_sha.clone(),
            trigger: run.event.to_string(),
            success: run.succeeded(),
            stages,
            tags: manifest
                .map(|m| m.tags.iter().map(|t| t.tag.clone()).collect())
                .unwrap_or_default(),
            manifest_digest: manifest.map(|m| m.digest.to_string()),
            scans: reports.iter().map(ScanSummaryArtifact::from_report).collect(),
        }
    }
}

/// Write run_summary.json in pretty JSON format.
pub fn write_run_summary_json(path: &Path, artifact: &RunSummaryArtifact) -> Result<()> {
    let content = serde_json::to_string_pretty(artifact).context("serialize run summary")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render markdown summary for a CI step summary.
pub fn render_run_summary_md(artifact: &RunSummaryArtifact) -> String {
    let mut out = String::new();
    let verdict = if artifact.success { "passed" } else { "failed" };
    out.push_str(&format!("# Pipeline {}\n\n", verdict));
    out.push_str(&format!(
        "- run: `{}`\n- commit: `{}`\n- trigger: {}\n\n",
        artifact.run_id, artifact.commit_sha, artifact.trigger
    ));

    out.push_str("## Stages\n");
    out.push_str("| stage | status | duration | detail |\n|---|---|---|---|\n");
    for s in &artifact.stages {
        let duration = s
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            s.stage,
            s.status,
            duration,
            s.detail.as_deref().unwrap_or("")
        ));
    }
    out.push('\n');

    if !artifact.tags.is_empty() {
        out.push_str("## Image\n");
        if let Some(digest) = &artifact.manifest_digest {
            out.push_str(&format!("- digest: `{}`\n", digest));
        }
        for t in &artifact.tags {
            out.push_str(&format!("- tag: `{}`\n", t));
        }
        out.push('\n');
    }

    if !artifact.scans.is_empty() {
        out.push_str("## Vulnerabilities\n");
        out.push_str("| image | critical | high | medium | low | unknown |\n|---|---|---|---|---|---|\n");
        for scan in &artifact.scans {
            out.push_str(&format!(
                "| `{}` | {} | {} | {} | {} | {} |\n",
                scan.image_ref, scan.critical, scan.high, scan.medium, scan.low, scan.unknown
            ));
        }
    }
    out
}

/// Write run_summary.md.
pub fn write_run_summary_md(path: &Path, artifact: &RunSummaryArtifact) -> Result<()> {
    let md = render_run_summary_md(artifact);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SkipReason, StageKind, TriggerEvent};
    use quayside_state::{Finding, ImageDigest};

    fn finding(id: &str, severity: Severity) -> Finding {
        Finding {
            id: id.to_string(),
            package: "openssl".to_string(),
            installed_version: "3.0.1".to_string(),
            fixed_version: Some("3.0.2".to_string()),
            severity,
            title: None,
        }
    }

    fn failed_pr_run() -> PipelineRun {
        let mut run = PipelineRun::new(
            "1a2b3c4d",
            TriggerEvent::pull_request(12, "feature/login", "main"),
            "main",
        );
        run.transition(StageKind::Test, StageStatus::Running).unwrap();
        run.append_log(StageKind::Test, "mix test exited with 2");
        run.transition(StageKind::Test, StageStatus::Failed).unwrap();
        for kind in [StageKind::Build, StageKind::SecurityScan, StageKind::Deploy] {
            run.skip(kind, SkipReason::NotTriggered).unwrap();
        }
        run
    }

    #[test]
    fn summary_schema_has_expected_keys() {
        let report = VulnerabilityReport {
            image_digest: ImageDigest::of_bytes(b"img"),
            image_ref: "ghcr.io/acme/shop:main".to_string(),
            scanner: "trivy".to_string(),
            findings: vec![
                finding("CVE-1", Severity::Critical),
                finding("CVE-2", Severity::Low),
                finding("CVE-3", Severity::Low),
            ],
            scanned_at: Utc::now(),
        };
        let artifact = RunSummaryArtifact::from_run("run-1", &failed_pr_run(), &[report]);

        let raw = serde_json::to_value(&artifact).expect("serialize artifact");
        let obj = raw.as_object().expect("artifact object");
        for key in ["schema_version", "run_id", "commit_sha", "trigger", "stages", "scans"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(raw["success"], false);
        assert_eq!(raw["stages"][0]["detail"], "mix test exited with 2");
        assert_eq!(raw["scans"][0]["critical"], 1);
        assert_eq!(raw["scans"][0]["low"], 2);
    }

    #[test]
    fn markdown_lists_every_stage() {
        let artifact = RunSummaryArtifact::from_run("run-1", &failed_pr_run(), &[]);
        let md = render_run_summary_md(&artifact);
        assert!(md.starts_with("# Pipeline failed\n"));
        assert!(md.contains("| test | failed |"));
        assert!(md.contains("| security_scan | skipped | - | not triggered |"));
        assert!(!md.contains("## Vulnerabilities"));
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = RunSummaryArtifact::from_run("run-1", &failed_pr_run(), &[]);
        let json_path = dir.path().join("run_summary.json");
        let md_path = dir.path().join("run_summary.md");
        write_run_summary_json(&json_path, &artifact).unwrap();
        write_run_summary_md(&md_path, &artifact).unwrap();

        let back: RunSummaryArtifact =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(back.run_id, "run-1");
        assert!(std::fs::read_to_string(&md_path)
            .unwrap()
            .contains("## Stages"));
    }
}
