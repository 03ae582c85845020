//! Idempotent deployment against a target environment.
//!
//! [`deploy_image`] consults the [`DeploymentRegistry`] before touching
//! anything: an environment already running the digest is left alone and
//! reported as [`DeployOutcome::AlreadyCurrent`]. Otherwise the [`Deployer`]
//! applies the image and a new record is appended.

use std::str::FromStr;

use async_trait::async_trait;
use quayside_state::{
    DeploymentMetadata, DeploymentRecord, DeploymentRegistry, ImageDigest, RunId,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{ImageRef, QuaysideError, Result};

/// Environment a deployment is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    pub environment: String,
}

impl DeployTarget {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }
}

/// Applies an image to an environment (e.g. updates a running workload).
///
/// Implementations must be safe to re-run with the same arguments.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn apply(
        &self,
        target: &DeployTarget,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> Result<()>;
}

/// Result of a deploy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// A new deployment was applied and recorded.
    Deployed(DeploymentRecord),
    /// The environment already runs this digest; nothing changed.
    AlreadyCurrent(DeploymentRecord),
}

impl DeployOutcome {
    pub fn record(&self) -> &DeploymentRecord {
        match self {
            DeployOutcome::Deployed(r) | DeployOutcome::AlreadyCurrent(r) => r,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, DeployOutcome::Deployed(_))
    }
}

/// Deploy `image` (pinned to `digest`) to `target`, unless it is already current.
pub async fn deploy_image(
    registry: &dyn DeploymentRegistry,
    deployer: &dyn Deployer,
    target: &DeployTarget,
    image: &ImageRef,
    digest: &ImageDigest,
    run_id: Option<&RunId>,
) -> Result<DeployOutcome> {
    if let Some(current) = registry.current(&target.environment).await? {
        if &current.image_digest == digest {
            info!(
                environment = %target.environment,
                digest = %digest,
                "image already deployed, nothing to do"
            );
            return Ok(DeployOutcome::AlreadyCurrent(current));
        }
    }

    deployer.apply(target, image, digest).await?;

    let metadata = DeploymentMetadata {
        image_ref: image.to_string(),
        deployed_by: "quayside".to_string(),
        run_id: run_id.map(|r| r.to_string()),
        notes: None,
    };
    let record = registry
        .record(&target.environment, digest, metadata)
        .await?;
    info!(environment = %target.environment, digest = %digest, image = %image, "deployed");
    Ok(DeployOutcome::Deployed(record))
}

/// Re-deploy the environment's previous image and append it to the history.
pub async fn rollback(
    registry: &dyn DeploymentRegistry,
    deployer: &dyn Deployer,
    target: &DeployTarget,
) -> Result<DeploymentRecord> {
    let history = registry.history(&target.environment).await?;
    let previous = match history.as_slice() {
        [] => {
            return Err(QuaysideError::Deploy(format!(
                "environment '{}' has never been deployed",
                target.environment
            )))
        }
        [_] => {
            return Err(QuaysideError::Deploy(format!(
                "environment '{}' has no previous deployment",
                target.environment
            )))
        }
        [_, previous, ..] => previous,
    };

    let image = ImageRef::from_str(&previous.metadata.image_ref)?;
    deployer
        .apply(target, &image, &previous.image_digest)
        .await?;

    let record = registry.rollback(&target.environment).await?;
    info!(
        environment = %target.environment,
        digest = %record.image_digest,
        "rolled back"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quayside_state::fakes::MemoryDeploymentRegistry;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingDeployer {
        applied: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Deployer for CountingDeployer {
        async fn apply(
            &self,
            _target: &DeployTarget,
            image: &ImageRef,
            digest: &ImageDigest,
        ) -> Result<()> {
            if self.fail {
                return Err(QuaysideError::Deploy("rollout timed out".to_string()));
            }
            self.applied
                .lock()
                .unwrap()
                .push(format!("{}@{}", image, digest.short()));
            Ok(())
        }
    }

    fn image(tag: &str) -> ImageRef {
        ImageRef::new("ghcr.io", "acme", "shop", tag).unwrap()
    }

    #[tokio::test]
    async fn redeploying_same_digest_is_a_no_op() {
        let registry = MemoryDeploymentRegistry::new();
        let deployer = CountingDeployer::default();
        let target = DeployTarget::new("production");
        let digest = ImageDigest::of_bytes(b"v1");

        let first = deploy_image(&registry, &deployer, &target, &image("main"), &digest, None)
            .await
            .unwrap();
        assert!(first.was_applied());

        let second = deploy_image(&registry, &deployer, &target, &image("main"), &digest, None)
            .await
            .unwrap();
        assert!(!second.was_applied());
        assert_eq!(deployer.applied.lock().unwrap().len(), 1);
        assert_eq!(registry.history("production").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_apply_records_nothing() {
        let registry = MemoryDeploymentRegistry::new();
        let deployer = CountingDeployer {
            fail: true,
            ..Default::default()
        };
        let err = deploy_image(
            &registry,
            &deployer,
            &DeployTarget::new("production"),
            &image("main"),
            &ImageDigest::of_bytes(b"v1"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QuaysideError::Deploy(_)));
        assert!(registry.current("production").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_reapplies_previous_image() {
        let registry = MemoryDeploymentRegistry::new();
        let deployer = CountingDeployer::default();
        let target = DeployTarget::new("production");
        let d1 = ImageDigest::of_bytes(b"v1");
        let d2 = ImageDigest::of_bytes(b"v2");
        let run = RunId::new();

        deploy_image(&registry, &deployer, &target, &image("main-1111111"), &d1, Some(&run))
            .await
            .unwrap();
        deploy_image(&registry, &deployer, &target, &image("main-2222222"), &d2, None)
            .await
            .unwrap();

        let record = rollback(&registry, &deployer, &target).await.unwrap();
        assert_eq!(record.image_digest, d1);
        assert_eq!(record.metadata.run_id, Some(run.to_string()));

        let applied = deployer.applied.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied[2].starts_with("ghcr.io/acme/shop:main-1111111@"));
    }

    #[tokio::test]
    async fn rollback_without_history_fails() {
        let registry = MemoryDeploymentRegistry::new();
        let deployer = CountingDeployer::default();
        let err = rollback(&registry, &deployer, &DeployTarget::new("staging"))
            .await
            .unwrap_err();
        assert!(matches!(err, QuaysideError::Deploy(_)));
    }
}
