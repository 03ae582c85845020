use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use quayside_core::{deploy_image, DeployOutcome, DeployTarget, Deployer, ImageRef};
use quayside_state::fakes::MemoryDeploymentRegistry;
use quayside_state::{DeploymentRegistry, ImageDigest, RunId, SurrealDeploymentRegistry};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingDeployer {
    calls: AtomicUsize,
}

#[async_trait]
impl Deployer for CountingDeployer {
    async fn apply(
        &self,
        _target: &DeployTarget,
        _image: &ImageRef,
        _digest: &ImageDigest,
    ) -> quayside_core::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn image() -> ImageRef {
    "ghcr.io/acme/shop:main-1a2b3c4".parse().expect("image ref")
}

async fn assert_redeploy_is_noop(registry: &dyn DeploymentRegistry) {
    let deployer = CountingDeployer::default();
    let target = DeployTarget::new("production");
    let digest = ImageDigest::of_bytes(b"release-1");
    let run = RunId::new();

    let first = deploy_image(registry, &deployer, &target, &image(), &digest, Some(&run))
        .await
        .expect("first deploy");
    assert!(matches!(first, DeployOutcome::Deployed(_)));
    let before = registry.history("production").await.expect("history");

    for _ in 0..3 {
        let again = deploy_image(registry, &deployer, &target, &image(), &digest, None)
            .await
            .expect("redeploy");
        assert!(matches!(again, DeployOutcome::AlreadyCurrent(_)));
        assert_eq!(again.record().image_digest, digest);
    }

    let after = registry.history("production").await.expect("history");
    assert_eq!(before, after);
    assert_eq!(deployer.calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Idempotence against both registry backends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redeploy_is_noop_in_memory() {
    let registry = MemoryDeploymentRegistry::new();
    assert_redeploy_is_noop(&registry).await;
}

#[tokio::test]
async fn redeploy_is_noop_in_surreal() {
    let registry = SurrealDeploymentRegistry::in_memory()
        .await
        .expect("in-memory surreal");
    assert_redeploy_is_noop(&registry).await;
}

#[tokio::test]
async fn new_digest_is_applied_per_environment() {
    let registry = MemoryDeploymentRegistry::new();
    let deployer = CountingDeployer::default();
    let digest = ImageDigest::of_bytes(b"release-1");

    for env in ["staging", "production"] {
        let outcome = deploy_image(
            &registry,
            &deployer,
            &DeployTarget::new(env),
            &image(),
            &digest,
            None,
        )
        .await
        .expect("deploy");
        assert!(outcome.was_applied());
    }
    assert_eq!(deployer.calls.load(Ordering::SeqCst), 2);
}
