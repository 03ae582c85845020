//! SurrealDB-backed DeploymentRegistry implementation
//!
//! Deployments are append-only; the newest row per environment is current.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle::StoreHandle;
use crate::schema::DeploymentRow;
use crate::storage_traits::{
    DeploymentMetadata, DeploymentRecord, DeploymentRegistry, ImageDigest, StorageResult,
};

fn storage_err(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`DeploymentRegistry`].
#[derive(Clone)]
pub struct SurrealDeploymentRegistry {
    handle: StoreHandle,
}

impl SurrealDeploymentRegistry {
    pub fn new(handle: StoreHandle) -> Self {
        Self { handle }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(StoreHandle::in_memory().await?))
    }

    async fn rows(&self, environment: &str, limit: Option<usize>) -> StorageResult<Vec<DeploymentRow>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT * FROM deployments WHERE environment = $env ORDER BY deployed_at DESC LIMIT {n}"
            ),
            None => {
                "SELECT * FROM deployments WHERE environment = $env ORDER BY deployed_at DESC"
                    .to_string()
            }
        };
        let mut res = self
            .handle
            .db()
            .query(sql)
            .bind(("env", environment.to_string()))
            .await
            .map_err(storage_err)?;
        res.take(0).map_err(storage_err)
    }

    async fn insert(&self, row: DeploymentRow) -> StorageResult<DeploymentRecord> {
        let _created: Option<DeploymentRow> = self
            .handle
            .db()
            .create("deployments")
            .content(row.clone())
            .await
            .map_err(storage_err)?;
        Self::to_record(row)
    }

    fn to_record(row: DeploymentRow) -> StorageResult<DeploymentRecord> {
        Ok(DeploymentRecord {
            environment: row.environment,
            image_digest: ImageDigest::try_from(row.image_digest)?,
            metadata: row.metadata,
            deployed_at: row.deployed_at,
        })
    }
}

#[async_trait]
impl DeploymentRegistry for SurrealDeploymentRegistry {
    async fn record(
        &self,
        environment: &str,
        image_digest: &ImageDigest,
        metadata: DeploymentMetadata,
    ) -> StorageResult<DeploymentRecord> {
        debug!(environment, digest = %image_digest, "recording deployment");
        self.insert(DeploymentRow {
            id: None,
            environment: environment.to_string(),
            image_digest: image_digest.as_str().to_string(),
            metadata,
            deployed_at: Utc::now(),
        })
        .await
    }

    async fn rollback(&self, environment: &str) -> StorageResult<DeploymentRecord> {
        let rows = self.rows(environment, Some(2)).await?;
        match rows.len() {
            0 => Err(StorageError::DeploymentNotFound {
                environment: environment.to_string(),
            }),
            1 => Err(StorageError::NoPreviousDeployment {
                environment: environment.to_string(),
            }),
            _ => {
                let mut previous = rows[1].clone();
                previous.id = None;
                previous.deployed_at = Utc::now();
                info!(environment, digest = %previous.image_digest, "rolling back deployment");
                self.insert(previous).await
            }
        }
    }

    async fn current(&self, environment: &str) -> StorageResult<Option<DeploymentRecord>> {
        self.rows(environment, Some(1))
            .await?
            .into_iter()
            .next()
            .map(Self::to_record)
            .transpose()
    }

    async fn history(&self, environment: &str) -> StorageResult<Vec<DeploymentRecord>> {
        self.rows(environment, None)
            .await?
            .into_iter()
            .map(Self::to_record)
            .collect()
    }
}
