//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunLedger`, `MemoryReportStore`, and
//! `MemoryDeploymentRegistry` that satisfy the trait contracts without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

impl RunState {
    fn ensure_running(&self) -> StorageResult<()> {
        if self.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: self.record.run_id.0.clone(),
                status: self.record.status.as_str().to_string(),
                expected: RunStatus::Running.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        self.ensure_running()?;
        self.record.status = status;
        self.record.summary = Some(summary);
        self.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunState) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        f(state)
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.with_run(run_id, |state| {
            state.ensure_running()?;
            state.events.push(event);
            Ok(())
        })
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Completed, summary))
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Failed, summary))
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Cancelled, summary))
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.with_run(run_id, |state| Ok(state.record.clone()))
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.with_run(run_id, |state| {
            let mut events = state.events.clone();
            events.sort_by_key(|e| e.seq);
            Ok(events)
        })
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                spec_digest
                    .map(|d| s.record.spec_digest == *d)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryReportStore
// ---------------------------------------------------------------------------

/// In-memory report store backed by a `HashMap<digest, report>`.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<String, VulnerabilityReport>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct digests with a report.
    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn publish(&self, report: &VulnerabilityReport) -> StorageResult<()> {
        let mut reports = self.reports.lock().unwrap();
        reports.insert(report.image_digest.as_str().to_string(), report.clone());
        Ok(())
    }

    async fn get(&self, digest: &ImageDigest) -> StorageResult<VulnerabilityReport> {
        let reports = self.reports.lock().unwrap();
        reports
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::ReportNotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn list_at_least(&self, min: Severity) -> StorageResult<Vec<VulnerabilityReport>> {
        let reports = self.reports.lock().unwrap();
        let mut matching: Vec<VulnerabilityReport> = reports
            .values()
            .filter(|r| !r.findings_at_least(min).is_empty())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.scanned_at.cmp(&a.scanned_at));
        Ok(matching)
    }
}

// ---------------------------------------------------------------------------
// MemoryDeploymentRegistry
// ---------------------------------------------------------------------------

/// In-memory deployment registry backed by a `HashMap<environment, Vec<DeploymentRecord>>`.
///
/// Each environment maps to its full deployment history (newest last internally).
#[derive(Debug, Default)]
pub struct MemoryDeploymentRegistry {
    deployments: Mutex<HashMap<String, Vec<DeploymentRecord>>>,
}

impl MemoryDeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRegistry for MemoryDeploymentRegistry {
    async fn record(
        &self,
        environment: &str,
        image_digest: &ImageDigest,
        metadata: DeploymentMetadata,
    ) -> StorageResult<DeploymentRecord> {
        let record = DeploymentRecord {
            environment: environment.to_string(),
            image_digest: image_digest.clone(),
            metadata,
            deployed_at: Utc::now(),
        };
        let mut deployments = self.deployments.lock().unwrap();
        deployments
            .entry(environment.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn rollback(&self, environment: &str) -> StorageResult<DeploymentRecord> {
        let mut deployments = self.deployments.lock().unwrap();
        let history =
            deployments
                .get_mut(environment)
                .ok_or_else(|| StorageError::DeploymentNotFound {
                    environment: environment.to_string(),
                })?;
        if history.len() < 2 {
            return Err(StorageError::NoPreviousDeployment {
                environment: environment.to_string(),
            });
        }
        // Append-only: re-deploy the previous record as a new entry.
        let mut previous = history[history.len() - 2].clone();
        previous.deployed_at = Utc::now();
        history.push(previous.clone());
        Ok(previous)
    }

    async fn current(&self, environment: &str) -> StorageResult<Option<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments.get(environment).and_then(|h| h.last().cloned()))
    }

    async fn history(&self, environment: &str) -> StorageResult<Vec<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        let mut history = deployments.get(environment).cloned().unwrap_or_default();
        history.reverse(); // newest first
        Ok(history)
    }
}
