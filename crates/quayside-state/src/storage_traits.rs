//! Storage trait definitions for Quayside
//!
//! These traits define the persistence seams of the pipeline:
//! - `RunLedger`: pipeline run persistence (events, summaries)
//! - `ReportStore`: the security-reporting surface (reports keyed by image digest)
//! - `DeploymentRegistry`: per-environment deployment history (deploy/rollback)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OCI image digest in `sha256:<64 hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageDigest(String);

impl ImageDigest {
    const PREFIX: &'static str = "sha256:";

    /// Digest of raw manifest bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        ImageDigest(format!(
            "{}{}",
            Self::PREFIX,
            ContentDigest::from_bytes(data).as_str()
        ))
    }

    /// Full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[Self::PREFIX.len()..]
    }

    /// First 12 hex chars, as shown by `docker images`.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let trimmed = s.trim();
        let hex_part = trimmed.strip_prefix(Self::PREFIX).unwrap_or(trimmed);
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ImageDigest(format!(
            "{}{}",
            Self::PREFIX,
            hex_part.to_ascii_lowercase()
        )))
    }
}

impl FromStr for ImageDigest {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ImageDigest::try_from(s.to_string())
    }
}

impl From<ImageDigest> for String {
    fn from(d: ImageDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunLedger - Pipeline Run Persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Commit SHA the run validates
    pub git_sha: Option<String>,
    /// Pipeline name (usually the image name)
    pub pipeline: String,
    /// Trigger description, e.g. `push:main` or `pull_request:42`
    pub trigger: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "stage_started", "image_pushed")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StorageError::Backend(format!("unknown run status: {other}"))),
        }
    }
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Finished runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is finished.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as cancelled.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs (newest first), optionally filtered by spec digest.
    async fn list_runs(&self, spec_digest: Option<&ContentDigest>)
        -> StorageResult<Vec<RunRecord>>;
}

// ---------------------------------------------------------------------------
// ReportStore - Security Reporting Surface
// ---------------------------------------------------------------------------

/// Vulnerability severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Unknown,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "UNKNOWN",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" | "NEGLIGIBLE" | "INFO" | "INFORMATIONAL" => Ok(Severity::Unknown),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" | "MODERATE" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(StorageError::Backend(format!("unknown severity: {other}"))),
        }
    }
}

/// A single vulnerability finding in an image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Advisory identifier (CVE / GHSA)
    pub id: String,
    /// Affected package
    pub package: String,
    /// Installed version
    pub installed_version: String,
    /// First fixed version, if any
    pub fixed_version: Option<String>,
    pub severity: Severity,
    pub title: Option<String>,
}

/// Scan result for one image, keyed 1:1 by its digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub image_digest: ImageDigest,
    /// Reference that was scanned (`registry/namespace/name:tag`)
    pub image_ref: String,
    /// Scanner name and version, e.g. `trivy 0.50.1`
    pub scanner: String,
    pub findings: Vec<Finding>,
    pub scanned_at: DateTime<Utc>,
}

impl VulnerabilityReport {
    /// Number of findings with exactly the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Per-severity counts; every severity is present.
    pub fn counts(&self) -> BTreeMap<Severity, usize> {
        Severity::ALL.iter().map(|s| (*s, self.count(*s))).collect()
    }

    /// Findings at or above `min`.
    pub fn findings_at_least(&self, min: Severity) -> Vec<&Finding> {
        self.findings.iter().filter(|f| f.severity >= min).collect()
    }

    /// Highest severity present, `None` for a clean image.
    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Security-reporting surface.
///
/// Semantics:
/// - `publish` stores the report under its image digest; a re-scan of the
///   same digest replaces the previous report.
/// - Reports are never attached to tags, only to digests.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store a report under `report.image_digest`.
    async fn publish(&self, report: &VulnerabilityReport) -> StorageResult<()>;

    /// Fetch the report for a digest. Returns `ReportNotFound` if absent.
    async fn get(&self, digest: &ImageDigest) -> StorageResult<VulnerabilityReport>;

    /// Findings for a digest at or above `min` severity.
    async fn query(&self, digest: &ImageDigest, min: Severity) -> StorageResult<Vec<Finding>> {
        let report = self.get(digest).await?;
        Ok(report
            .findings_at_least(min)
            .into_iter()
            .cloned()
            .collect())
    }

    /// All reports containing at least one finding at or above `min`.
    async fn list_at_least(&self, min: Severity) -> StorageResult<Vec<VulnerabilityReport>>;
}

// ---------------------------------------------------------------------------
// DeploymentRegistry - Per-environment Deployment History
// ---------------------------------------------------------------------------

/// Metadata for a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    /// Reference that was deployed (`registry/namespace/name:tag`)
    pub image_ref: String,
    /// Who or what deployed it
    pub deployed_by: String,
    /// Pipeline run that produced the deployment
    pub run_id: Option<String>,
    pub notes: Option<String>,
}

/// A single deployment record (pointer from environment → image digest)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub environment: String,
    pub image_digest: ImageDigest,
    pub metadata: DeploymentMetadata,
    pub deployed_at: DateTime<Utc>,
}

/// Deployment registry.
///
/// Semantics:
/// - `record` appends a new deployment as the environment's current one.
/// - `rollback` re-appends the previous deployment, preserving the full
///   audit trail (history is append-only).
/// - `history` returns the chain newest first.
#[async_trait]
pub trait DeploymentRegistry: Send + Sync {
    /// Record a deployment for the environment.
    async fn record(
        &self,
        environment: &str,
        image_digest: &ImageDigest,
        metadata: DeploymentMetadata,
    ) -> StorageResult<DeploymentRecord>;

    /// Roll back to the previous deployment. Fails if there is none.
    async fn rollback(&self, environment: &str) -> StorageResult<DeploymentRecord>;

    /// Current (most recent) deployment, if any.
    async fn current(&self, environment: &str) -> StorageResult<Option<DeploymentRecord>>;

    /// Full deployment history (newest first).
    async fn history(&self, environment: &str) -> StorageResult<Vec<DeploymentRecord>>;
}
