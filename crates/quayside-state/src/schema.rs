//! SurrealDB row types
//!
//! Rows mirror the `storage_traits` records but keep SurrealDB-native
//! datetimes and string statuses; conversion happens at the backend boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{DeploymentMetadata, Finding, Severity};

/// Serialize chrono DateTime as a SurrealDB datetime
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Optional variant of [`surreal_datetime`]
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Pipeline run row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique run ID (UUID string)
    pub run_id: String,
    /// Run spec digest (SHA256)
    pub spec_digest: String,
    pub git_sha: Option<String>,
    pub pipeline: String,
    pub trigger: String,
    /// Arbitrary tags (JSON)
    pub tags: serde_json::Value,
    /// "running" | "completed" | "failed" | "cancelled"
    pub status: String,
    pub total_events: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    /// Create a new row in "running" state
    pub fn new(
        run_id: String,
        spec_digest: String,
        git_sha: Option<String>,
        pipeline: String,
        trigger: String,
        tags: serde_json::Value,
    ) -> Self {
        RunRow {
            id: None,
            run_id,
            spec_digest,
            git_sha,
            pipeline,
            trigger,
            tags,
            status: "running".to_string(),
            total_events: 0,
            duration_ms: 0,
            success: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Fields merged into a run row when it reaches a terminal status
#[derive(Debug, Clone, Serialize)]
pub struct RunFinish {
    pub status: String,
    pub total_events: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub completed_at: DateTime<Utc>,
}

impl RunFinish {
    pub fn new(status: &str, total_events: u64, duration_ms: u64, success: bool) -> Self {
        RunFinish {
            status: status.to_string(),
            total_events,
            duration_ms,
            success,
            completed_at: Utc::now(),
        }
    }
}

/// Single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    /// Monotonic sequence number within run (1-indexed)
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl RunEventRow {
    pub fn new(
        run_id: String,
        seq: u64,
        kind: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        RunEventRow {
            id: None,
            run_id,
            seq,
            kind,
            payload,
            timestamp,
        }
    }
}

/// Vulnerability report row, unique per image digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub image_digest: String,
    pub image_ref: String,
    pub scanner: String,
    pub findings: Vec<Finding>,
    /// Highest severity as an ordinal (0 = clean / unknown only)
    pub max_severity: u8,
    #[serde(with = "surreal_datetime")]
    pub scanned_at: DateTime<Utc>,
}

/// Ordinal used for the `max_severity` index.
pub fn severity_rank(severity: Severity) -> u8 {
    match severity {
        Severity::Unknown => 0,
        Severity::Low => 1,
        Severity::Medium => 2,
        Severity::High => 3,
        Severity::Critical => 4,
    }
}

/// Deployment row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub environment: String,
    pub image_digest: String,
    pub metadata: DeploymentMetadata,
    #[serde(with = "surreal_datetime")]
    pub deployed_at: DateTime<Utc>,
}
