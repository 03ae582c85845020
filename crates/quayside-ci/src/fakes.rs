//! In-process stage backends for tests and dry runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use quayside_core::{
    BuiltImage, DeployTarget, Deployer, ImageManifest, ImageRef, QuaysideError,
};
use quayside_state::{Finding, ImageDigest, VulnerabilityReport};

use crate::build::{BuildRequest, ImageBuilder};
use crate::error::CiError;
use crate::runner::{CommandExecutor, CommandOutput};
use crate::scan::VulnerabilityScanner;
use crate::stage::StageCommand;
use crate::test_stage::TestSuite;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn starts_with(command: &[String], prefix: &[&str]) -> bool {
    command.len() >= prefix.len() && command.iter().zip(prefix).all(|(a, b)| a == b)
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// Executor answering by command prefix; unmatched commands succeed with
/// empty output. Every command is recorded.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<Vec<(Vec<String>, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<StageCommand>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer commands starting with `prefix` with `output`.
    pub fn respond(&self, prefix: &[&str], output: CommandOutput) {
        self.respond_sequence(prefix, vec![output]);
    }

    /// Answer successive matching calls in order; the last answer repeats.
    pub fn respond_sequence(&self, prefix: &[&str], outputs: Vec<CommandOutput>) {
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        lock(&self.scripts).push((prefix, outputs.into()));
    }

    pub fn commands(&self) -> Vec<StageCommand> {
        lock(&self.calls).clone()
    }

    pub fn calls_matching(&self, prefix: &[&str]) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| starts_with(&c.command, prefix))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &StageCommand) -> Result<CommandOutput, CiError> {
        if command.command.is_empty() {
            return Err(CiError::EmptyCommand {
                stage: command.name.clone(),
            });
        }
        lock(&self.calls).push(command.clone());

        let mut scripts = lock(&self.scripts);
        // Latest registration wins.
        let matched = scripts.iter_mut().rev().find(|(prefix, _)| {
            let p: Vec<&str> = prefix.iter().map(String::as_str).collect();
            starts_with(&command.command, &p)
        });
        let output = match matched {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some((_, queue)) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput::ok(""),
        };
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// FakeTestSuite
// ---------------------------------------------------------------------------

pub struct FakeTestSuite {
    failure: Option<String>,
    delay: Option<Duration>,
    runs: AtomicUsize,
    settles: AtomicUsize,
}

impl FakeTestSuite {
    pub fn passing() -> Self {
        Self {
            failure: None,
            delay: None,
            runs: AtomicUsize::new(0),
            settles: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::passing()
        }
    }

    /// Sleep before answering, to keep a run in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Times the pipeline waited for leftover cleanup.
    pub fn settles(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestSuite for FakeTestSuite {
    async fn run_suite(&self) -> Result<Vec<String>, CiError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(msg) => Err(CiError::CommandFailed {
                stage: "mix test".to_string(),
                exit_code: 2,
                stderr: msg.clone(),
            }),
            None => Ok(vec!["42 tests, 0 failures".to_string()]),
        }
    }

    async fn settle(&self) {
        self.settles.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// FakeImageBuilder
// ---------------------------------------------------------------------------

/// Builder whose digests derive from repository and platform.
#[derive(Default)]
pub struct FakeImageBuilder {
    failing: HashSet<String>,
    attempts: AtomicUsize,
    manifests: Mutex<Vec<ImageManifest>>,
}

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, platform: &str) -> Self {
        self.failing.insert(platform.to_string());
        self
    }

    pub fn builds_attempted(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn manifests(&self) -> Vec<ImageManifest> {
        lock(&self.manifests).clone()
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, CiError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        // Let sibling jobs interleave.
        tokio::task::yield_now().await;
        if self.failing.contains(request.platform.as_str()) {
            return Err(CiError::CommandFailed {
                stage: format!("build {}", request.platform),
                exit_code: 1,
                stderr: "exec format error".to_string(),
            });
        }
        let seed = format!(
            "{}|{}|{}",
            request.image.repository(),
            request.platform,
            request.commit_sha
        );
        Ok(BuiltImage {
            platform: request.platform.clone(),
            digest: ImageDigest::of_bytes(seed.as_bytes()),
            tags: Vec::new(),
        })
    }

    async fn publish_manifest(
        &self,
        images: &[BuiltImage],
        tags: &[ImageRef],
    ) -> Result<ImageManifest, CiError> {
        let seed: String = images.iter().map(|i| i.digest.to_string()).collect();
        let manifest = ImageManifest {
            digest: ImageDigest::of_bytes(seed.as_bytes()),
            tags: tags.to_vec(),
            platforms: images.iter().map(|i| i.platform.clone()).collect(),
        };
        lock(&self.manifests).push(manifest.clone());
        Ok(manifest)
    }
}

// ---------------------------------------------------------------------------
// FakeScanner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeScanner {
    findings: Vec<Finding>,
    fail: bool,
    scanned: Mutex<Vec<ImageDigest>>,
}

impl FakeScanner {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn with_findings(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            ..Self::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn scanned(&self) -> Vec<ImageDigest> {
        lock(&self.scanned).clone()
    }
}

#[async_trait]
impl VulnerabilityScanner for FakeScanner {
    async fn scan(
        &self,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> Result<VulnerabilityReport, CiError> {
        if self.fail {
            return Err(CiError::ScanParse("scanner database unavailable".to_string()));
        }
        lock(&self.scanned).push(digest.clone());
        Ok(VulnerabilityReport {
            image_digest: digest.clone(),
            image_ref: image.to_string(),
            scanner: "fake".to_string(),
            findings: self.findings.clone(),
            scanned_at: chrono::Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingDeployer
// ---------------------------------------------------------------------------

/// Deployer that records what each environment was asked to run.
#[derive(Default)]
pub struct RecordingDeployer {
    applied: Mutex<Vec<(String, ImageDigest)>>,
    current: Mutex<HashMap<String, ImageDigest>>,
    fail: bool,
}

impl RecordingDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn applied(&self) -> Vec<(String, ImageDigest)> {
        lock(&self.applied).clone()
    }

    /// Digest an environment is running, as the deployer last set it.
    pub fn running(&self, environment: &str) -> Option<ImageDigest> {
        lock(&self.current).get(environment).cloned()
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    async fn apply(
        &self,
        target: &DeployTarget,
        _image: &ImageRef,
        digest: &ImageDigest,
    ) -> quayside_core::Result<()> {
        if self.fail {
            return Err(QuaysideError::Deploy(format!(
                "{}: rollout timed out",
                target.environment
            )));
        }
        lock(&self.applied).push((target.environment.clone(), digest.clone()));
        lock(&self.current).insert(target.environment.clone(), digest.clone());
        Ok(())
    }
}
