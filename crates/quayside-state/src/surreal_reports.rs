//! SurrealDB-backed ReportStore implementation

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::handle::StoreHandle;
use crate::schema::{severity_rank, ReportRow};
use crate::storage_traits::{
    ImageDigest, ReportStore, Severity, StorageResult, VulnerabilityReport,
};

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`ReportStore`].
#[derive(Clone)]
pub struct SurrealReportStore {
    handle: StoreHandle,
}

impl SurrealReportStore {
    pub fn new(handle: StoreHandle) -> Self {
        Self { handle }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(StoreHandle::in_memory().await?))
    }

    fn to_row(report: &VulnerabilityReport) -> ReportRow {
        ReportRow {
            id: None,
            image_digest: report.image_digest.as_str().to_string(),
            image_ref: report.image_ref.clone(),
            scanner: report.scanner.clone(),
            findings: report.findings.clone(),
            max_severity: report.highest_severity().map(severity_rank).unwrap_or(0),
            scanned_at: report.scanned_at,
        }
    }

    fn from_row(row: ReportRow) -> StorageResult<VulnerabilityReport> {
        Ok(VulnerabilityReport {
            image_digest: ImageDigest::try_from(row.image_digest)?,
            image_ref: row.image_ref,
            scanner: row.scanner,
            findings: row.findings,
            scanned_at: row.scanned_at,
        })
    }
}

#[async_trait]
impl ReportStore for SurrealReportStore {
    async fn publish(&self, report: &VulnerabilityReport) -> StorageResult<()> {
        let digest = report.image_digest.as_str().to_string();
        let row = Self::to_row(report);

        debug!(digest = %digest, findings = report.findings.len(), "publishing scan report");

        // A re-scan replaces the previous report for the digest.
        self.handle
            .db()
            .query("DELETE scan_reports WHERE image_digest = $digest")
            .bind(("digest", digest))
            .await
            .map_err(backend)?;

        let _created: Option<ReportRow> = self
            .handle
            .db()
            .create("scan_reports")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn get(&self, digest: &ImageDigest) -> StorageResult<VulnerabilityReport> {
        let d = digest.as_str().to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM scan_reports WHERE image_digest = $digest")
            .bind(("digest", d))
            .await
            .map_err(backend)?;

        let rows: Vec<ReportRow> = res.take(0).map_err(backend)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::ReportNotFound {
                digest: digest.as_str().to_string(),
            })?;
        Self::from_row(row)
    }

    async fn list_at_least(&self, min: Severity) -> StorageResult<Vec<VulnerabilityReport>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * FROM scan_reports WHERE array::len(findings) > 0 \
                 AND max_severity >= $rank ORDER BY scanned_at DESC",
            )
            .bind(("rank", severity_rank(min)))
            .await
            .map_err(backend)?;

        let rows: Vec<ReportRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(Self::from_row).collect()
    }
}
