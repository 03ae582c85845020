//! Pipeline orchestration.
//!
//! A run walks the four stages in order. Before each stage the trigger gate
//! decides whether it may start given the event and the upstream results;
//! every decision, outcome and artifact is recorded in the run ledger. A
//! newer run in the same concurrency group cancels this one, after which the
//! remaining stages are skipped and the run is finalized as cancelled.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use quayside_core::obs;
use quayside_core::{
    deploy_image, derive_tags, short_sha, BuiltImage, DeployOutcome, DeployTarget, Deployer,
    Eligibility, EventKind, ImageManifest, PipelineConfig, PipelineRun, RunRecorder, SkipReason,
    StageKind, StageStatus, TriggerEvent, TriggerGate, METRICS,
};
use quayside_state::{
    DeploymentRegistry, ReportStore, RunId, RunLedger, RunMetadata, RunSummary,
    VulnerabilityReport,
};
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};

use crate::build::{run_matrix, BuildRequest, BuildxImageBuilder, ImageBuilder, RegistryLogin};
use crate::concurrency::{CancelToken, ConcurrencyGroups};
use crate::database::EphemeralDatabase;
use crate::deploy::CommandDeployer;
use crate::error::CiError;
use crate::gate::{CiGate, GateVerdict};
use crate::publish::{HttpReportPublisher, ReportPublisher, StorePublisher};
use crate::runner::{CommandExecutor, SystemExecutor};
use crate::scan::{ScanPolicy, TrivyScanner, VulnerabilityScanner};
use crate::spec::RunSpec;
use crate::test_stage::{CommandTestSuite, TestSuite};

/// The work behind each stage.
#[derive(Clone)]
pub struct StageBackends {
    pub tests: Arc<dyn TestSuite>,
    pub builder: Arc<dyn ImageBuilder>,
    pub scanner: Arc<dyn VulnerabilityScanner>,
    /// Every report goes to each publisher, in order.
    pub publishers: Vec<Arc<dyn ReportPublisher>>,
    pub deployer: Arc<dyn Deployer>,
    pub deployments: Arc<dyn DeploymentRegistry>,
}

impl StageBackends {
    /// Backends that shell out to docker, trivy and the configured commands.
    ///
    /// `run_tag` distinguishes this run's database container.
    pub fn from_config(
        config: &PipelineConfig,
        workdir: &Path,
        run_tag: &str,
        reports: Arc<dyn ReportStore>,
        deployments: Arc<dyn DeploymentRegistry>,
    ) -> Result<Self, CiError> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor);

        let database = EphemeralDatabase::new(config.database.clone(), run_tag);
        let tests = CommandTestSuite::new(executor.clone(), config.test.clone(), workdir)
            .with_database(database);

        let mut builder =
            BuildxImageBuilder::new(executor.clone(), workdir.join(".quayside").join("build"));
        if let Some(secs) = config.build.timeout_secs {
            builder = builder.with_timeout(secs);
        }
        if let (Some(username), Some(token)) = (&config.registry.username, &config.token) {
            builder = builder.with_login(RegistryLogin {
                registry: config.registry.registry.clone(),
                username: username.clone(),
                token: token.clone(),
            });
        }

        let mut scanner = TrivyScanner::new(executor.clone())
            .with_username(config.registry.username.clone())
            .with_token(config.token.clone());
        if let Some(secs) = config.scan.timeout_secs {
            scanner = scanner.with_timeout(secs);
        }

        let mut publishers: Vec<Arc<dyn ReportPublisher>> =
            vec![Arc::new(StorePublisher::new(reports))];
        if let Some(url) = &config.scan.report_url {
            publishers.push(Arc::new(HttpReportPublisher::new(
                url.clone(),
                config.token.clone(),
            )?));
        }

        let mut deployer = CommandDeployer::new(executor, config.deploy.commands.clone());
        if let Some(secs) = config.deploy.timeout_secs {
            deployer = deployer.with_timeout(secs);
        }

        Ok(Self {
            tests: Arc::new(tests),
            builder: Arc::new(builder),
            scanner: Arc::new(scanner),
            publishers,
            deployer: Arc::new(deployer),
            deployments,
        })
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub run: PipelineRun,
    /// Every planned stage succeeded and the run was not cancelled.
    pub success: bool,
    pub cancelled: bool,
    pub spec_digest: String,
    pub duration_ms: u64,
    pub reports: Vec<VulnerabilityReport>,
    pub deploy: Option<DeployOutcome>,
    /// Re-check of the recorded event trace.
    pub audit: GateVerdict,
}

impl PipelineResult {
    pub fn count(&self, status: StageStatus) -> usize {
        self.run
            .stages
            .iter()
            .filter(|s| s.status == status)
            .count()
    }

    pub fn passed_count(&self) -> usize {
        self.count(StageStatus::Succeeded)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(StageStatus::Skipped)
    }
}

/// What a stage produced, kept even when the stage failed part way.
#[derive(Default)]
struct StageWork {
    logs: Vec<String>,
    images: Vec<BuiltImage>,
    manifest: Option<ImageManifest>,
    reports: Vec<VulnerabilityReport>,
    deploy: Option<DeployOutcome>,
}

/// Results gathered across stages.
#[derive(Default)]
struct Progress {
    reports: Vec<VulnerabilityReport>,
    deploy: Option<DeployOutcome>,
    cancelled: bool,
}

/// Test → Build → Security Scan → Deploy.
pub struct Pipeline {
    config: PipelineConfig,
    gate: TriggerGate,
    backends: StageBackends,
    ledger: Arc<dyn RunLedger>,
    groups: Arc<ConcurrencyGroups>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backends: StageBackends, ledger: Arc<dyn RunLedger>) -> Self {
        let gate = TriggerGate::new(config.gate.clone());
        Self {
            config,
            gate,
            backends,
            ledger,
            groups: Arc::new(ConcurrencyGroups::new()),
        }
    }

    /// Share concurrency groups with other pipelines.
    pub fn with_groups(mut self, groups: Arc<ConcurrencyGroups>) -> Self {
        self.groups = groups;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gate(&self) -> &TriggerGate {
        &self.gate
    }

    pub fn groups(&self) -> &Arc<ConcurrencyGroups> {
        &self.groups
    }

    /// Run the pipeline for `commit_sha` under `event`.
    ///
    /// Stage failures are part of the result; `Err` means the run could not
    /// be planned or recorded.
    pub async fn run(&self, commit_sha: &str, event: TriggerEvent) -> anyhow::Result<PipelineResult> {
        short_sha(commit_sha)?;

        let pipeline = self.config.registry.name.clone();
        let plan = self.gate.plan(&event);
        let spec = RunSpec::new(
            pipeline.clone(),
            commit_sha,
            event.clone(),
            &plan,
            &self.config.build.platforms,
        );
        let spec_digest = spec.digest();

        let metadata = RunMetadata {
            git_sha: Some(commit_sha.to_string()),
            pipeline,
            trigger: event.to_string(),
            tags: json!({
                "planned": plan.planned.iter().map(|s| s.name()).collect::<Vec<_>>(),
                "platforms": spec.platforms,
                "stages_digest": spec.stages_digest,
            }),
        };
        let recorder = RunRecorder::start(self.ledger.clone(), &spec_digest, metadata).await?;
        let span = obs::run_span(recorder.run_id().as_str());

        self.drive(recorder, &spec, spec_digest.as_str().to_string())
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        recorder: RunRecorder,
        spec: &RunSpec,
        spec_digest: String,
    ) -> anyhow::Result<PipelineResult> {
        let started = Instant::now();
        let run_id = recorder.run_id().clone();
        METRICS.inc_runs();

        let group = ConcurrencyGroups::group_key(&spec.pipeline, &spec.event);
        let guard = self
            .groups
            .enter(group, self.config.concurrency.cancel_in_progress);
        let token = guard.token();

        let primary = self.gate.policy().primary_branch.clone();
        let mut run = PipelineRun::new(spec.commit_sha.clone(), spec.event.clone(), primary);
        let mut progress = Progress::default();

        let driven = self
            .drive_stages(&recorder, spec, &mut run, &mut progress, &token, guard.group())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // The run is finalized even when recording broke off part way.
        if let Err(e) = driven {
            warn!(run_id = %run_id, error = %e, "run aborted");
            let summary = RunSummary {
                total_events: recorder.events_recorded(),
                duration_ms,
                success: false,
            };
            if let Err(finalize) = recorder.finish_err(summary).await {
                obs::emit_run_finalize_error(run_id.as_str(), &finalize);
            }
            METRICS.flush();
            return Err(e);
        }

        let cancelled = progress.cancelled;
        let success = !cancelled && run.succeeded();
        let summary = RunSummary {
            total_events: recorder.events_recorded(),
            duration_ms,
            success,
        };
        let finalized = if cancelled {
            recorder.finish_cancelled(summary).await
        } else if success {
            recorder.finish_ok(summary).await
        } else {
            recorder.finish_err(summary).await
        };
        if let Err(e) = finalized {
            obs::emit_run_finalize_error(run_id.as_str(), &e);
            return Err(e.into());
        }
        drop(guard);

        let events = self.ledger.get_events(&run_id).await?;
        let audit = CiGate::evaluate(&events);
        obs::emit_gate_evaluated(run_id.as_str(), audit.violations.len(), audit.passed);
        METRICS.flush();

        info!(
            run_id = %run_id,
            success,
            cancelled,
            duration_ms,
            "pipeline run finished"
        );

        Ok(PipelineResult {
            run_id,
            run,
            success,
            cancelled,
            spec_digest,
            duration_ms,
            reports: progress.reports,
            deploy: progress.deploy,
            audit,
        })
    }

    /// Walk the stages, recording each decision and outcome.
    ///
    /// `Err` only when the run could not be recorded; the caller finalizes.
    async fn drive_stages(
        &self,
        recorder: &RunRecorder,
        spec: &RunSpec,
        run: &mut PipelineRun,
        progress: &mut Progress,
        token: &CancelToken,
        group: &str,
    ) -> anyhow::Result<()> {
        let run_id = recorder.run_id();
        let event = &spec.event;
        recorder
            .record(
                EventKind::RunStarted,
                json!({
                    "branch": event.branch(),
                    "pull_request": event.is_pull_request(),
                    "primary_branch": run.primary_branch,
                    "commit_sha": spec.commit_sha,
                    "planned": spec.planned.iter().map(|s| s.name()).collect::<Vec<_>>(),
                }),
            )
            .await?;

        for stage in StageKind::ALL {
            if !progress.cancelled && token.is_cancelled() {
                progress.cancelled = true;
                obs::emit_run_cancelled(run_id.as_str(), group);
            }
            if progress.cancelled {
                self.skip(recorder, run, stage, SkipReason::Cancelled).await?;
                continue;
            }
            if let Eligibility::Skip(reason) = self.gate.eligibility(stage, event, run) {
                self.skip(recorder, run, stage, reason).await?;
                continue;
            }

            run.transition(stage, StageStatus::Running)?;
            recorder
                .record(EventKind::StageStarted { stage }, Value::Null)
                .await?;
            obs::emit_stage_started(run_id.as_str(), stage.name());

            let mut work = StageWork::default();
            let result = match self
                .execute_with_cancel(stage, run, run_id, &mut work, token)
                .await
            {
                Some(result) => result,
                None => {
                    progress.cancelled = true;
                    obs::emit_run_cancelled(run_id.as_str(), group);
                    self.backends.tests.settle().await;
                    Err(CiError::Cancelled)
                }
            };

            for line in std::mem::take(&mut work.logs) {
                run.append_log(stage, line);
            }
            if work.deploy.is_some() {
                progress.deploy = work.deploy.clone();
            }
            progress.reports.extend(work.reports.iter().cloned());
            self.record_outputs(recorder, &work).await?;
            if !work.images.is_empty() {
                run.attach_images(std::mem::take(&mut work.images));
            }
            if let Some(manifest) = work.manifest.take() {
                run.attach_manifest(manifest);
            }

            match result {
                Ok(()) => {
                    run.transition(stage, StageStatus::Succeeded)?;
                    recorder
                        .record(EventKind::StageSucceeded { stage }, Value::Null)
                        .await?;
                }
                Err(e) => {
                    warn!(stage = %stage, error = %e, "stage failed");
                    run.append_log(stage, e.to_string());
                    run.transition(stage, StageStatus::Failed)?;
                    METRICS.inc_stages_failed();
                    recorder
                        .record(
                            EventKind::StageFailed { stage },
                            json!({ "error": e.to_string() }),
                        )
                        .await?;
                }
            }

            let result = run.stage(stage);
            obs::emit_stage_finished(
                run_id.as_str(),
                stage.name(),
                &result.status.to_string(),
                result.duration_ms().unwrap_or(0),
            );
        }

        if progress.cancelled {
            recorder
                .record(EventKind::RunCancelled, json!({ "group": group }))
                .await?;
        }
        Ok(())
    }

    /// `None` when the run was cancelled before the stage finished.
    async fn execute_with_cancel(
        &self,
        stage: StageKind,
        run: &PipelineRun,
        run_id: &RunId,
        work: &mut StageWork,
        token: &CancelToken,
    ) -> Option<Result<(), CiError>> {
        tokio::select! {
            result = self.execute_stage(stage, run, run_id, work) => Some(result),
            _ = token.cancelled() => None,
        }
    }

    async fn execute_stage(
        &self,
        stage: StageKind,
        run: &PipelineRun,
        run_id: &RunId,
        work: &mut StageWork,
    ) -> Result<(), CiError> {
        match stage {
            StageKind::Test => {
                work.logs = self.backends.tests.run_suite().await?;
                Ok(())
            }
            StageKind::Build => self.build(run, work).await,
            StageKind::SecurityScan => self.scan(run, work).await,
            StageKind::Deploy => self.deploy(run, run_id, work).await,
        }
    }

    async fn build(&self, run: &PipelineRun, work: &mut StageWork) -> Result<(), CiError> {
        let tags = derive_tags(run.event.branch(), &run.commit_sha, self.gate.policy())?;
        let refs = tags
            .iter()
            .map(|tag| self.config.registry.image(tag))
            .collect::<quayside_core::Result<Vec<_>>>()?;
        let traceable = refs
            .last()
            .cloned()
            .ok_or_else(|| CiError::BuildOutput("no tags derived".to_string()))?;

        let requests = self
            .config
            .build
            .platforms()
            .into_iter()
            .map(|platform| BuildRequest {
                platform,
                image: traceable.clone(),
                context: self.config.build.context.clone(),
                dockerfile: self.config.build.dockerfile.clone(),
                commit_sha: run.commit_sha.clone(),
            })
            .collect();

        let outcome = run_matrix(self.backends.builder.as_ref(), requests).await;
        METRICS.add_images_pushed(outcome.built.len() as u64);
        work.images = outcome.built.clone();
        for image in &outcome.built {
            work.logs
                .push(format!("{}: pushed {}", image.platform, image.digest));
        }
        for (platform, e) in &outcome.failed {
            work.logs.push(format!("{platform}: {e}"));
        }
        let built = outcome.into_result()?;

        let manifest = self.backends.builder.publish_manifest(&built, &refs).await?;
        work.logs.push(format!(
            "manifest {} tagged {}",
            manifest.digest,
            tags.join(", ")
        ));
        work.manifest = Some(manifest);
        Ok(())
    }

    async fn scan(&self, run: &PipelineRun, work: &mut StageWork) -> Result<(), CiError> {
        let build = run.stage(StageKind::Build);
        let manifest = build
            .manifest
            .as_ref()
            .ok_or_else(|| CiError::BuildOutput("build published no manifest".to_string()))?;
        let image = manifest
            .traceable_tag()
            .ok_or_else(|| CiError::BuildOutput("manifest has no tags".to_string()))?;

        for built in &build.images {
            let report = self.backends.scanner.scan(image, &built.digest).await?;
            for publisher in &self.backends.publishers {
                publisher.publish(&report).await?;
            }
            work.logs.push(format!(
                "{}: {} finding(s), highest {}",
                built.platform,
                report.findings.len(),
                report
                    .highest_severity()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ));
            work.reports.push(report);
        }

        ScanPolicy::new(self.config.scan.block_on).check(&work.reports)
    }

    async fn deploy(
        &self,
        run: &PipelineRun,
        run_id: &RunId,
        work: &mut StageWork,
    ) -> Result<(), CiError> {
        let manifest = run
            .manifest()
            .ok_or_else(|| CiError::BuildOutput("build published no manifest".to_string()))?;
        let image = manifest
            .traceable_tag()
            .ok_or_else(|| CiError::BuildOutput("manifest has no tags".to_string()))?;
        let target = DeployTarget::new(self.config.deploy.environment.clone());

        let outcome = deploy_image(
            self.backends.deployments.as_ref(),
            self.backends.deployer.as_ref(),
            &target,
            image,
            &manifest.digest,
            Some(run_id),
        )
        .await?;
        if outcome.was_applied() {
            METRICS.inc_deploys();
            work.logs
                .push(format!("{} now runs {}", target.environment, manifest.digest));
        } else {
            work.logs.push(format!(
                "{} already runs {}",
                target.environment, manifest.digest
            ));
        }
        work.deploy = Some(outcome);
        Ok(())
    }

    async fn skip(
        &self,
        recorder: &RunRecorder,
        run: &mut PipelineRun,
        stage: StageKind,
        reason: SkipReason,
    ) -> anyhow::Result<()> {
        run.skip(stage, reason)?;
        recorder
            .record(
                EventKind::StageSkipped { stage },
                json!({ "reason": reason, "detail": reason.to_string() }),
            )
            .await?;
        obs::emit_stage_skipped(recorder.run_id().as_str(), stage.name(), &reason.to_string());
        Ok(())
    }

    async fn record_outputs(&self, recorder: &RunRecorder, work: &StageWork) -> anyhow::Result<()> {
        for image in &work.images {
            recorder
                .record(
                    EventKind::ImagePushed {
                        platform: image.platform.to_string(),
                    },
                    json!({ "digest": image.digest }),
                )
                .await?;
        }
        if let Some(manifest) = &work.manifest {
            recorder
                .record(
                    EventKind::ManifestPublished,
                    json!({
                        "digest": manifest.digest,
                        "tags": manifest.tags.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                    }),
                )
                .await?;
        }
        for report in &work.reports {
            recorder
                .record(
                    EventKind::ReportPublished {
                        image_digest: report.image_digest.to_string(),
                    },
                    json!({
                        "findings": report.findings.len(),
                        "highest": report.highest_severity(),
                    }),
                )
                .await?;
        }
        if let Some(outcome) = &work.deploy {
            let record = outcome.record();
            let kind = if outcome.was_applied() {
                EventKind::Deployed {
                    environment: record.environment.clone(),
                }
            } else {
                EventKind::DeploySkippedCurrent {
                    environment: record.environment.clone(),
                }
            };
            recorder
                .record(kind, json!({ "digest": record.image_digest }))
                .await?;
        }
        Ok(())
    }
}
