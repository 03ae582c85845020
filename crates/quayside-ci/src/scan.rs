//! Security scan stage.
//!
//! The scanner only reads the pushed image; findings are data, not errors.
//! Whether findings fail the stage is decided by [`ScanPolicy`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use quayside_core::{ImageRef, StageKind};
use quayside_state::{Finding, ImageDigest, Severity, VulnerabilityReport};
use serde::Deserialize;

use crate::error::CiError;
use crate::runner::{run_checked, CommandExecutor};
use crate::stage::StageCommand;

/// Static vulnerability analysis of a pushed image.
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    /// Scan `image` pinned to `digest`. Tool failures are errors; findings
    /// are returned in the report.
    async fn scan(
        &self,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> Result<VulnerabilityReport, CiError>;
}

/// Blocking policy for findings. The default never blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanPolicy {
    pub block_on: Option<Severity>,
}

impl ScanPolicy {
    pub fn new(block_on: Option<Severity>) -> Self {
        Self { block_on }
    }

    pub fn blocking_findings<'a>(&self, report: &'a VulnerabilityReport) -> Vec<&'a Finding> {
        match self.block_on {
            Some(min) => report.findings_at_least(min),
            None => Vec::new(),
        }
    }

    /// Fail when any report has findings at or above the threshold.
    pub fn check(&self, reports: &[VulnerabilityReport]) -> Result<(), CiError> {
        let Some(threshold) = self.block_on else {
            return Ok(());
        };
        let count: usize = reports
            .iter()
            .map(|r| self.blocking_findings(r).len())
            .sum();
        if count > 0 {
            return Err(CiError::BlockingFindings { count, threshold });
        }
        Ok(())
    }
}

/// Trivy CLI scanner.
pub struct TrivyScanner {
    executor: Arc<dyn CommandExecutor>,
    username: Option<String>,
    token: Option<String>,
    timeout_secs: u64,
}

impl TrivyScanner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            username: None,
            token: None,
            timeout_secs: StageKind::SecurityScan.default_timeout().as_secs(),
        }
    }

    /// Registry token for pulling private images.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Registry user the token belongs to.
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn scan_command(&self, image: &ImageRef, digest: &ImageDigest) -> StageCommand {
        let mut cmd = StageCommand::new(
            "trivy image",
            [
                "trivy".to_string(),
                "image".to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--quiet".to_string(),
                image.pinned(digest),
            ],
            self.timeout_secs,
        );
        if let Some(token) = &self.token {
            if let Some(username) = &self.username {
                cmd = cmd.with_env("TRIVY_USERNAME", username.clone());
            }
            cmd = cmd.with_env("TRIVY_PASSWORD", token.clone());
        }
        cmd
    }
}

#[async_trait]
impl VulnerabilityScanner for TrivyScanner {
    async fn scan(
        &self,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> Result<VulnerabilityReport, CiError> {
        let out = run_checked(self.executor.as_ref(), &self.scan_command(image, digest)).await?;
        parse_trivy_report(&out.stdout, image, digest)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyOutput {
    #[serde(default)]
    results: Option<Vec<TrivyResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    pkg_name: String,
    #[serde(default)]
    installed_version: String,
    #[serde(default)]
    fixed_version: Option<String>,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    title: Option<String>,
}

/// Convert `trivy image --format json` output into a report.
pub fn parse_trivy_report(
    raw: &str,
    image: &ImageRef,
    digest: &ImageDigest,
) -> Result<VulnerabilityReport, CiError> {
    let output: TrivyOutput =
        serde_json::from_str(raw).map_err(|e| CiError::ScanParse(e.to_string()))?;

    let findings = output
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|r| r.vulnerabilities.unwrap_or_default())
        .map(|v| Finding {
            id: v.vulnerability_id,
            package: v.pkg_name,
            installed_version: v.installed_version,
            fixed_version: v.fixed_version.filter(|f| !f.is_empty()),
            severity: v.severity.parse().unwrap_or(Severity::Unknown),
            title: v.title,
        })
        .collect();

    Ok(VulnerabilityReport {
        image_digest: digest.clone(),
        image_ref: image.to_string(),
        scanner: "trivy".to_string(),
        findings,
        scanned_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedExecutor;
    use crate::runner::CommandOutput;

    const TRIVY_JSON: &str = r#"{
        "SchemaVersion": 2,
        "ArtifactName": "ghcr.io/acme/shop@sha256:abc",
        "Results": [
            {"Target": "ghcr.io/acme/shop (alpine 3.19.1)", "Class": "os-pkgs", "Vulnerabilities": [
                {"VulnerabilityID": "CVE-2024-0001", "PkgName": "libssl3", "InstalledVersion": "3.1.4-r2",
                 "FixedVersion": "3.1.4-r5", "Severity": "HIGH", "Title": "openssl: excessive time"},
                {"VulnerabilityID": "CVE-2024-0002", "PkgName": "busybox", "InstalledVersion": "1.36.1-r15",
                 "FixedVersion": "", "Severity": "LOW"}
            ]},
            {"Target": "app/lib", "Class": "lang-pkgs", "Vulnerabilities": null},
            {"Target": "Dockerfile", "Class": "config"}
        ]
    }"#;

    fn image() -> ImageRef {
        "ghcr.io/acme/shop:main-1a2b3c4".parse().unwrap()
    }

    #[test]
    fn parses_findings_across_results() {
        let digest = ImageDigest::of_bytes(b"img");
        let report = parse_trivy_report(TRIVY_JSON, &image(), &digest).unwrap();
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.image_digest, digest);
        assert_eq!(report.count(Severity::High), 1);
        assert_eq!(report.findings[1].fixed_version, None);
        assert_eq!(report.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn clean_image_and_garbage() {
        let digest = ImageDigest::of_bytes(b"img");
        let clean = parse_trivy_report(r#"{"SchemaVersion":2}"#, &image(), &digest).unwrap();
        assert!(clean.findings.is_empty());
        assert!(matches!(
            parse_trivy_report("FATAL error", &image(), &digest),
            Err(CiError::ScanParse(_))
        ));
    }

    #[test]
    fn policy_blocks_only_when_configured() {
        let digest = ImageDigest::of_bytes(b"img");
        let report = parse_trivy_report(TRIVY_JSON, &image(), &digest).unwrap();
        let reports = vec![report];

        assert!(ScanPolicy::default().check(&reports).is_ok());
        assert!(ScanPolicy::new(Some(Severity::Critical)).check(&reports).is_ok());
        let err = ScanPolicy::new(Some(Severity::Low)).check(&reports).unwrap_err();
        assert!(matches!(err, CiError::BlockingFindings { count: 2, .. }));
    }

    #[tokio::test]
    async fn scanner_targets_pinned_digest() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.respond(&["trivy", "image"], CommandOutput::ok(TRIVY_JSON));
        let scanner = TrivyScanner::new(exec.clone())
            .with_username(Some("octocat".to_string()))
            .with_token(Some("t0k".to_string()));
        let digest = ImageDigest::of_bytes(b"img");

        let report = scanner.scan(&image(), &digest).await.unwrap();
        assert_eq!(report.findings.len(), 2);

        let cmd = exec.commands().pop().unwrap();
        assert_eq!(cmd.command.last().unwrap(), &image().pinned(&digest));
        assert_eq!(cmd.env["TRIVY_USERNAME"], "octocat");
        assert_eq!(cmd.env["TRIVY_PASSWORD"], "t0k");
        assert!(!cmd.display().contains("t0k"));
    }

    #[test]
    fn anonymous_scan_sets_no_credentials() {
        let scanner = TrivyScanner::new(Arc::new(ScriptedExecutor::new()))
            .with_username(Some("octocat".to_string()));
        let cmd = scanner.scan_command(&image(), &ImageDigest::of_bytes(b"img"));
        assert!(!cmd.env.contains_key("TRIVY_USERNAME"));
        assert!(!cmd.env.contains_key("TRIVY_PASSWORD"));
    }

    #[tokio::test]
    async fn scanner_tool_error_is_fatal() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.respond(&["trivy"], CommandOutput::failed(1, "unable to pull image"));
        let scanner = TrivyScanner::new(exec);
        let err = scanner
            .scan(&image(), &ImageDigest::of_bytes(b"img"))
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::CommandFailed { .. }));
    }
}
