//! Integration tests for the pipeline with in-memory backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quayside_ci::fakes::{FakeImageBuilder, FakeScanner, FakeTestSuite, RecordingDeployer};
use quayside_ci::{Pipeline, StageBackends, StorePublisher};
use quayside_core::{
    DeployOutcome, PipelineConfig, SkipReason, StageKind, StageStatus, TriggerEvent,
};
use quayside_state::fakes::{MemoryDeploymentRegistry, MemoryReportStore, MemoryRunLedger};
use quayside_state::{
    ContentDigest, DeploymentRegistry, Finding, ReportStore, RunEvent, RunId, RunLedger,
    RunMetadata, RunRecord, RunStatus, RunSummary, Severity, StorageError, StorageResult,
};

const SHA: &str = "1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b";

struct Rig {
    tests: Arc<FakeTestSuite>,
    builder: Arc<FakeImageBuilder>,
    scanner: Arc<FakeScanner>,
    deployer: Arc<RecordingDeployer>,
    ledger: Arc<MemoryRunLedger>,
    reports: Arc<MemoryReportStore>,
    deployments: Arc<MemoryDeploymentRegistry>,
}

impl Rig {
    fn new() -> Self {
        Self {
            tests: Arc::new(FakeTestSuite::passing()),
            builder: Arc::new(FakeImageBuilder::new()),
            scanner: Arc::new(FakeScanner::clean()),
            deployer: Arc::new(RecordingDeployer::new()),
            ledger: Arc::new(MemoryRunLedger::new()),
            reports: Arc::new(MemoryReportStore::new()),
            deployments: Arc::new(MemoryDeploymentRegistry::new()),
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        let backends = StageBackends {
            tests: self.tests.clone(),
            builder: self.builder.clone(),
            scanner: self.scanner.clone(),
            publishers: vec![Arc::new(StorePublisher::new(self.reports.clone()))],
            deployer: self.deployer.clone(),
            deployments: self.deployments.clone(),
        };
        Pipeline::new(config, backends, self.ledger.clone())
    }
}

/// Ledger whose first append of a given event kind fails.
struct BrokenAppendLedger {
    inner: MemoryRunLedger,
    kind: &'static str,
    tripped: AtomicBool,
}

impl BrokenAppendLedger {
    fn failing_on(kind: &'static str) -> Self {
        Self {
            inner: MemoryRunLedger::new(),
            kind,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RunLedger for BrokenAppendLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        self.inner.create_run(spec_digest, metadata).await
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        if event.kind == self.kind && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Backend("connection reset".to_string()));
        }
        self.inner.append_event(run_id, event).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.complete_run(run_id, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.fail_run(run_id, summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.cancel_run(run_id, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.inner.get_events(run_id).await
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(spec_digest).await
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.registry.namespace = "acme".to_string();
    config.registry.name = "shop".to_string();
    config
}

fn finding(id: &str, severity: Severity) -> Finding {
    Finding {
        id: id.to_string(),
        package: "openssl".to_string(),
        installed_version: "3.0.1".to_string(),
        fixed_version: Some("3.0.7".to_string()),
        severity,
        title: None,
    }
}

/// Test: push to main runs every stage and deploys the manifest digest
#[tokio::test]
async fn main_push_runs_every_stage_and_deploys() {
    let rig = Rig::new();
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert!(result.success, "{:?}", result.run.stages);
    assert_eq!(result.passed_count(), 4);
    assert!(result.audit.passed, "{:?}", result.audit.violations);

    let manifest = result.run.manifest().expect("manifest published");
    let tags: Vec<String> = manifest.tags.iter().map(|t| t.to_string()).collect();
    assert_eq!(
        tags,
        vec![
            "ghcr.io/acme/shop:latest",
            "ghcr.io/acme/shop:main",
            "ghcr.io/acme/shop:main-1a2b3c4",
        ]
    );
    assert_eq!(manifest.platforms.len(), 2);

    // One report per platform image, all in the store.
    assert_eq!(result.reports.len(), 2);
    for image in &result.run.stage(StageKind::Build).images {
        let report = rig.reports.get(&image.digest).await.expect("report stored");
        assert_eq!(report.image_ref, "ghcr.io/acme/shop:main-1a2b3c4");
    }

    match result.deploy.as_ref().expect("deploy outcome") {
        DeployOutcome::Deployed(record) => {
            assert_eq!(record.environment, "production");
            assert_eq!(record.image_digest, manifest.digest);
        }
        other => panic!("expected a fresh deployment, got {other:?}"),
    }
    assert_eq!(
        rig.deployer.running("production"),
        Some(manifest.digest.clone())
    );

    let run = rig.ledger.get_run(&result.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let events = rig.ledger.get_events(&result.run_id).await.unwrap();
    assert_eq!(run.summary.unwrap().total_events, events.len() as u64);
}

/// Test: pull requests run only the test stage
#[tokio::test]
async fn pull_request_runs_test_only() {
    let rig = Rig::new();
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::pull_request(17, "feature/login", "main"))
        .await
        .expect("pipeline failed");

    assert!(result.success);
    assert_eq!(result.run.status(StageKind::Test), StageStatus::Succeeded);
    for stage in [StageKind::Build, StageKind::SecurityScan, StageKind::Deploy] {
        assert_eq!(
            result.run.stage(stage).skip_reason,
            Some(SkipReason::NotTriggered),
            "{stage}"
        );
    }
    assert_eq!(rig.builder.builds_attempted(), 0);
    assert!(rig.deployer.applied().is_empty());

    let kinds: Vec<String> = rig
        .ledger
        .get_events(&result.run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "stage_started",
            "stage_succeeded",
            "stage_skipped",
            "stage_skipped",
            "stage_skipped",
        ]
    );
}

/// Test: a failing test suite means no image is ever built
#[tokio::test]
async fn failed_tests_skip_build() {
    let rig = Rig {
        tests: Arc::new(FakeTestSuite::failing("1 test, 1 failure")),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert!(!result.success);
    assert_eq!(result.failed_count(), 1);
    assert_eq!(result.skipped_count(), 3);
    assert_eq!(
        result.run.stage(StageKind::Build).skip_reason,
        Some(SkipReason::UpstreamFailed(StageKind::Test))
    );
    assert_eq!(rig.builder.builds_attempted(), 0);
    assert!(rig.deployer.applied().is_empty());
    assert!(result
        .run
        .stage(StageKind::Test)
        .logs
        .iter()
        .any(|l| l.contains("1 failure")));

    assert!(result.audit.ordering_ok);
    assert!(!result.audit.passed);
    let run = rig.ledger.get_run(&result.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

/// Test: develop builds and scans but never deploys
#[tokio::test]
async fn develop_push_builds_without_deploying() {
    let rig = Rig::new();
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("develop"))
        .await
        .expect("pipeline failed");

    assert!(result.success);
    assert_eq!(result.passed_count(), 3);
    assert_eq!(
        result.run.stage(StageKind::Deploy).skip_reason,
        Some(SkipReason::NotTriggered)
    );
    let tags: Vec<String> = result
        .run
        .manifest()
        .unwrap()
        .tags
        .iter()
        .map(|t| t.tag.clone())
        .collect();
    assert_eq!(tags, vec!["develop", "develop-1a2b3c4"]);
    assert!(result.deploy.is_none());
}

/// Test: extra build branches are tagged with their sanitized name
#[tokio::test]
async fn extra_build_branch_gets_slug_tag() {
    let mut config = config();
    config.gate.build_branches.push("release/2.x".to_string());
    let rig = Rig::new();
    let result = rig
        .pipeline(config)
        .run(SHA, TriggerEvent::push("release/2.x"))
        .await
        .expect("pipeline failed");

    let manifest = result.run.manifest().unwrap();
    assert_eq!(
        manifest.traceable_tag().unwrap().tag,
        "release-2.x-1a2b3c4"
    );
    assert_eq!(manifest.tags[0].tag, "release-2.x");
    assert_eq!(manifest.tags.len(), 2);
    assert_eq!(result.run.stage(StageKind::Deploy).skip_reason, Some(SkipReason::NotTriggered));
}

/// Test: one platform failing fails Build without stopping its sibling
#[tokio::test]
async fn platform_failure_fails_build_and_blocks_deploy() {
    let rig = Rig {
        builder: Arc::new(FakeImageBuilder::new().failing_on("linux/arm64")),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert!(!result.success);
    assert_eq!(result.run.status(StageKind::Build), StageStatus::Failed);
    assert_eq!(rig.builder.builds_attempted(), 2);
    assert!(rig.builder.manifests().is_empty());

    // The amd64 image was pushed before the stage failed.
    let build = result.run.stage(StageKind::Build);
    assert_eq!(build.images.len(), 1);
    assert_eq!(build.images[0].platform.as_str(), "linux/amd64");
    assert!(build.logs.iter().any(|l| l.contains("exec format error")));

    assert_eq!(
        result.run.stage(StageKind::SecurityScan).skip_reason,
        Some(SkipReason::UpstreamFailed(StageKind::Build))
    );
    assert_eq!(result.run.status(StageKind::Deploy), StageStatus::Skipped);
    assert!(rig.deployer.applied().is_empty());

    let pushed = rig
        .ledger
        .get_events(&result.run_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == "image_pushed")
        .count();
    assert_eq!(pushed, 1);
}

/// Test: findings at the blocking threshold fail Scan and block Deploy
#[tokio::test]
async fn blocking_findings_fail_scan() {
    let mut config = config();
    config.scan.block_on = Some(Severity::High);
    let rig = Rig {
        scanner: Arc::new(FakeScanner::with_findings(vec![
            finding("CVE-2022-3602", Severity::Critical),
            finding("CVE-2023-0001", Severity::Low),
        ])),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config)
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert_eq!(
        result.run.status(StageKind::SecurityScan),
        StageStatus::Failed
    );
    assert_eq!(
        result.run.stage(StageKind::Deploy).skip_reason,
        Some(SkipReason::UpstreamFailed(StageKind::SecurityScan))
    );
    assert!(rig.deployer.applied().is_empty());

    // Reports are published even when they block.
    let blocking = rig.reports.list_at_least(Severity::Critical).await.unwrap();
    assert_eq!(blocking.len(), 2);
}

/// Test: findings below the threshold are reported but do not block
#[tokio::test]
async fn findings_below_threshold_only_report() {
    let mut config = config();
    config.scan.block_on = Some(Severity::Critical);
    let rig = Rig {
        scanner: Arc::new(FakeScanner::with_findings(vec![finding(
            "CVE-2023-0001",
            Severity::Medium,
        )])),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config)
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert!(result.success);
    assert_eq!(result.reports[0].highest_severity(), Some(Severity::Medium));
}

/// Test: a scanner error fails the stage
#[tokio::test]
async fn scanner_error_fails_scan() {
    let rig = Rig {
        scanner: Arc::new(FakeScanner::broken()),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert_eq!(
        result.run.status(StageKind::SecurityScan),
        StageStatus::Failed
    );
    assert!(result.reports.is_empty());
}

/// Test: running the same commit again leaves the environment untouched
#[tokio::test]
async fn redeploying_same_commit_is_a_no_op() {
    let rig = Rig::new();
    let pipeline = rig.pipeline(config());

    let first = pipeline
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("first run");
    let second = pipeline
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("second run");

    assert!(matches!(first.deploy, Some(DeployOutcome::Deployed(_))));
    assert!(matches!(
        second.deploy,
        Some(DeployOutcome::AlreadyCurrent(_))
    ));
    assert!(second.success);
    assert_eq!(rig.deployer.applied().len(), 1);
    assert_eq!(rig.deployments.history("production").await.unwrap().len(), 1);

    let events = rig.ledger.get_events(&second.run_id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "deploy_skipped_current"));
    assert!(!events.iter().any(|e| e.kind == "deployed"));

    // Same commit, event and plan: same spec digest.
    assert_eq!(first.spec_digest, second.spec_digest);
}

/// Test: a failing deployment fails the run and records nothing
#[tokio::test]
async fn failed_deploy_is_not_recorded() {
    let rig = Rig {
        deployer: Arc::new(RecordingDeployer::failing()),
        ..Rig::new()
    };
    let result = rig
        .pipeline(config())
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("pipeline failed");

    assert_eq!(result.run.status(StageKind::Deploy), StageStatus::Failed);
    assert!(result.deploy.is_none());
    assert!(rig.deployments.current("production").await.unwrap().is_none());
}

/// Test: a newer run on the same branch cancels the one in flight
#[tokio::test]
async fn newer_run_cancels_in_flight_run() {
    let rig = Rig {
        tests: Arc::new(FakeTestSuite::passing().with_delay(Duration::from_millis(300))),
        ..Rig::new()
    };
    let pipeline = Arc::new(rig.pipeline(config()));

    let older = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(SHA, TriggerEvent::push("main")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let newer_sha = "9f8e7d6c5b4a39281706f5e4d3c2b1a098765432";
    let newer = pipeline
        .run(newer_sha, TriggerEvent::push("main"))
        .await
        .expect("newer run");
    let older = older.await.unwrap().expect("older run");

    assert!(older.cancelled);
    assert!(!older.success);
    assert_eq!(older.run.status(StageKind::Test), StageStatus::Failed);
    assert_eq!(rig.tests.settles(), 1);
    for stage in [StageKind::Build, StageKind::SecurityScan, StageKind::Deploy] {
        assert_eq!(
            older.run.stage(stage).skip_reason,
            Some(SkipReason::Cancelled)
        );
    }
    let record = rig.ledger.get_run(&older.run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);

    assert!(newer.success);
    assert!(!newer.cancelled);
    assert_eq!(rig.deployer.applied().len(), 1);
    assert_eq!(pipeline.groups().in_flight(), 0);
}

/// Test: runs on other branches are never cancelled
#[tokio::test]
async fn runs_on_other_branches_proceed() {
    let rig = Rig {
        tests: Arc::new(FakeTestSuite::passing().with_delay(Duration::from_millis(100))),
        ..Rig::new()
    };
    let pipeline = Arc::new(rig.pipeline(config()));

    let develop = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(SHA, TriggerEvent::push("develop")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let main = pipeline
        .run(SHA, TriggerEvent::push("main"))
        .await
        .expect("main run");
    let develop = develop.await.unwrap().expect("develop run");

    assert!(main.success);
    assert!(develop.success);
    assert!(!develop.cancelled);
    assert_eq!(rig.tests.runs(), 2);
}

/// Test: a malformed commit is rejected before anything is recorded
#[tokio::test]
async fn malformed_commit_is_rejected() {
    let rig = Rig::new();
    let err = rig
        .pipeline(config())
        .run("not-a-sha", TriggerEvent::push("main"))
        .await;
    assert!(err.is_err());
    assert!(rig.ledger.list_runs(None).await.unwrap().is_empty());
}

/// Test: a pull request from a branch leaves the push run on that branch alone
#[tokio::test]
async fn pull_request_does_not_cancel_push_on_its_head_branch() {
    let rig = Rig {
        tests: Arc::new(FakeTestSuite::passing().with_delay(Duration::from_millis(300))),
        ..Rig::new()
    };
    let pipeline = Arc::new(rig.pipeline(config()));

    let push = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(SHA, TriggerEvent::push("develop")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pr = pipeline
        .run(SHA, TriggerEvent::pull_request(12, "develop", "main"))
        .await
        .expect("pull request run");
    let push = push.await.unwrap().expect("push run");

    assert!(pr.success);
    assert!(!push.cancelled);
    assert!(push.success, "{:?}", push.run.stages);
    assert_eq!(push.run.status(StageKind::Build), StageStatus::Succeeded);
    assert_eq!(push.run.status(StageKind::SecurityScan), StageStatus::Succeeded);
    assert_eq!(pipeline.groups().in_flight(), 0);
}

/// Test: a newer run of the same pull request supersedes the older one
#[tokio::test]
async fn newer_pull_request_run_cancels_older_one() {
    let rig = Rig {
        tests: Arc::new(FakeTestSuite::passing().with_delay(Duration::from_millis(300))),
        ..Rig::new()
    };
    let pipeline = Arc::new(rig.pipeline(config()));

    let older = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .run(SHA, TriggerEvent::pull_request(12, "feature/cart", "main"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let newer = pipeline
        .run(
            "9f8e7d6c5b4a39281706f5e4d3c2b1a098765432",
            TriggerEvent::pull_request(12, "feature/cart", "main"),
        )
        .await
        .expect("newer run");
    let older = older.await.unwrap().expect("older run");

    assert!(older.cancelled);
    assert!(newer.success);
}

/// Test: a ledger failure mid-run still finalizes the run as failed
#[tokio::test]
async fn ledger_failure_mid_run_finalizes_run() {
    let rig = Rig::new();
    let ledger = Arc::new(BrokenAppendLedger::failing_on("stage_started"));
    let backends = StageBackends {
        tests: rig.tests.clone(),
        builder: rig.builder.clone(),
        scanner: rig.scanner.clone(),
        publishers: vec![Arc::new(StorePublisher::new(rig.reports.clone()))],
        deployer: rig.deployer.clone(),
        deployments: rig.deployments.clone(),
    };
    let pipeline = Pipeline::new(config(), backends, ledger.clone());

    let err = pipeline.run(SHA, TriggerEvent::push("main")).await;
    assert!(err.is_err());
    assert_eq!(rig.tests.runs(), 0);

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(!runs[0].summary.as_ref().unwrap().success);
    assert_eq!(pipeline.groups().in_flight(), 0);
}

/// Test: losing the deployed event after an apply still closes the run
#[tokio::test]
async fn ledger_failure_after_deploy_finalizes_run() {
    let rig = Rig::new();
    let ledger = Arc::new(BrokenAppendLedger::failing_on("deployed"));
    let backends = StageBackends {
        tests: rig.tests.clone(),
        builder: rig.builder.clone(),
        scanner: rig.scanner.clone(),
        publishers: vec![Arc::new(StorePublisher::new(rig.reports.clone()))],
        deployer: rig.deployer.clone(),
        deployments: rig.deployments.clone(),
    };
    let pipeline = Pipeline::new(config(), backends, ledger.clone());

    assert!(pipeline.run(SHA, TriggerEvent::push("main")).await.is_err());

    // The deployment happened and is in the registry; the run says it failed.
    assert_eq!(rig.deployer.applied().len(), 1);
    assert!(rig.deployments.current("production").await.unwrap().is_some());
    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
}
