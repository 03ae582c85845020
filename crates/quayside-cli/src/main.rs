//! Quayside - container delivery pipeline CLI
//!
//! The `quayside` command runs the Test -> Build -> Security Scan -> Deploy
//! pipeline for a commit and inspects what earlier runs recorded.
//!
//! ## Commands
//!
//! - `run`: Run the pipeline for a commit
//! - `plan`: Show which stages a trigger event makes eligible, and the tags
//! - `runs`: List recorded runs or show one run's events
//! - `reports`: Show published vulnerability reports
//! - `deploy`: Deployment status, history and rollback
//! - `error-view`: Render a fixed JSON error body

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use quayside_ci::{
    CiGate, CommandDeployer, ConcurrencyGroups, Pipeline, PipelineResult, StageBackends,
    SystemExecutor,
};
use quayside_core::obs::RunSpan;
use quayside_core::{
    capture_head_sha, current_branch, derive_tags, error_view, is_git_repo, render_run_summary_md,
    short_sha, write_run_summary_json, write_run_summary_md, DeployTarget, PipelineConfig,
    RunSummaryArtifact, StageStatus, TriggerEvent, TriggerGate, DEFAULT_CONFIG_FILE,
};
use quayside_state::{
    DeploymentRegistry, ImageDigest, ReportStore, RunId, RunLedger, Severity, StoreHandle,
    SurrealDeploymentRegistry, SurrealReportStore, SurrealRunLedger,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "quayside")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gated container delivery pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Trigger event; read from the GitHub Actions environment when omitted.
#[derive(Args, Debug, Clone, Default)]
struct TriggerArgs {
    /// Branch pushed to (or the pull request's head branch)
    #[arg(long)]
    branch: Option<String>,

    /// Pull request number; makes the event a pull request
    #[arg(long, requires = "branch")]
    pr: Option<u64>,

    /// Pull request base branch
    #[arg(long, default_value = "main")]
    base: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a commit and record the run
    Run {
        /// Workspace path (default: current directory)
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Pipeline config file (default: <workspace>/quayside.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Commit to run (default: GITHUB_SHA, then git HEAD)
        #[arg(long, env = "GITHUB_SHA")]
        sha: Option<String>,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Where run_summary.json / run_summary.md are written
        /// (default: <workspace>/.quayside/runs/<run id>)
        #[arg(long)]
        summary_dir: Option<PathBuf>,
    },

    /// Show the stages a trigger event makes eligible and the tags a build gets
    Plan {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long, env = "GITHUB_SHA")]
        sha: Option<String>,

        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Recorded pipeline runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Published vulnerability reports
    Reports {
        #[command(subcommand)]
        action: ReportsAction,
    },

    /// Deployment registry operations (status/history/rollback)
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },

    /// Print the JSON error body for a template such as `404.json`
    ErrorView {
        /// Template name
        template: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run's status, events and audit verdict
    Show {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum ReportsAction {
    /// Show the report for an image digest
    Show {
        /// Image digest (sha256:...)
        digest: String,

        /// Only list findings at or above this severity
        #[arg(long, default_value = "UNKNOWN")]
        min: Severity,
    },
    /// List reports with findings at or above a severity
    List {
        #[arg(long, default_value = "HIGH")]
        min: Severity,
    },
}

#[derive(Subcommand)]
enum DeployAction {
    /// Show what an environment currently runs
    Status {
        /// Environment name
        environment: String,
    },
    /// Show an environment's deployments, newest first
    History {
        /// Environment name
        environment: String,
    },
    /// Redeploy the previous image and record it as current
    Rollback {
        /// Environment name
        environment: String,

        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    quayside_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            workspace,
            config,
            sha,
            trigger,
            summary_dir,
        } => {
            cmd_run(
                &workspace,
                config.as_deref(),
                sha,
                &trigger,
                summary_dir.as_deref(),
            )
            .await
        }
        Commands::Plan {
            workspace,
            config,
            sha,
            trigger,
        } => {
            let config = load_config(&workspace, config.as_deref())?;
            let event = resolve_event(&trigger, &workspace, |k| std::env::var(k).ok())?;
            print!("{}", render_plan(&config, &event, sha.as_deref())?);
            Ok(())
        }
        Commands::ErrorView { template } => {
            println!("{}", render_error_view(&template)?);
            Ok(())
        }
        Commands::Runs { action } => {
            let ledger = SurrealRunLedger::new(connect_store().await?);
            match action {
                RunsAction::List { limit } => cmd_runs_list(&ledger, limit).await,
                RunsAction::Show { run_id } => cmd_runs_show(&ledger, &run_id).await,
            }
        }
        Commands::Reports { action } => {
            let store = SurrealReportStore::new(connect_store().await?);
            match action {
                ReportsAction::Show { digest, min } => cmd_reports_show(&store, &digest, min).await,
                ReportsAction::List { min } => cmd_reports_list(&store, min).await,
            }
        }
        Commands::Deploy { action } => {
            let registry = SurrealDeploymentRegistry::new(connect_store().await?);
            match action {
                DeployAction::Status { environment } => {
                    cmd_deploy_status(&registry, &environment).await
                }
                DeployAction::History { environment } => {
                    cmd_deploy_history(&registry, &environment).await
                }
                DeployAction::Rollback {
                    environment,
                    workspace,
                    config,
                } => {
                    let config = load_config(&workspace, config.as_deref())?;
                    cmd_deploy_rollback(&registry, &config, &environment).await
                }
            }
        }
    }
}

async fn connect_store() -> Result<StoreHandle> {
    StoreHandle::from_env()
        .await
        .context("Failed to connect to the Quayside store")
}

fn load_config(workspace: &Path, path: Option<&Path>) -> Result<PipelineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workspace.join(DEFAULT_CONFIG_FILE));
    PipelineConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Flags first, then the GitHub Actions environment, then the checked-out
/// branch as a push.
fn resolve_event<F>(args: &TriggerArgs, workspace: &Path, lookup: F) -> Result<TriggerEvent>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(branch) = &args.branch {
        return Ok(match args.pr {
            Some(number) => TriggerEvent::pull_request(number, branch.clone(), args.base.clone()),
            None => TriggerEvent::push(branch.clone()),
        });
    }
    if lookup("GITHUB_EVENT_NAME").is_some() {
        return TriggerEvent::from_github_env(lookup).context("Cannot read the trigger event");
    }
    if !is_git_repo(workspace) {
        anyhow::bail!("{} is not a git checkout; pass --branch", workspace.display());
    }
    let branch = current_branch(workspace).context("Cannot determine the branch; pass --branch")?;
    Ok(TriggerEvent::push(branch))
}

fn resolve_sha(sha: Option<String>, workspace: &Path) -> Result<String> {
    match sha {
        Some(sha) => Ok(sha),
        None => capture_head_sha(workspace).context("Cannot determine the commit; pass --sha"),
    }
}

// ========== Pipeline Commands ==========

async fn cmd_run(
    workspace: &Path,
    config_path: Option<&Path>,
    sha: Option<String>,
    trigger: &TriggerArgs,
    summary_dir: Option<&Path>,
) -> Result<()> {
    let config = load_config(workspace, config_path)?;
    let event = resolve_event(trigger, workspace, |k| std::env::var(k).ok())?;
    let sha = resolve_sha(sha, workspace)?;
    let run_tag = short_sha(&sha)?;

    let handle = connect_store().await?;
    let ledger = Arc::new(SurrealRunLedger::new(handle.clone()));
    let reports = Arc::new(SurrealReportStore::new(handle.clone()));
    let deployments = Arc::new(SurrealDeploymentRegistry::new(handle));

    let backends = StageBackends::from_config(&config, workspace, &run_tag, reports, deployments)?;
    let pipeline = Pipeline::new(config, backends, ledger);

    println!("Running pipeline for {} ({})", run_tag, event);
    println!();

    // Ctrl-C cancels through the run's concurrency group so it is finalized.
    let group = ConcurrencyGroups::group_key(&pipeline.config().registry.name, &event);
    let groups = pipeline.groups().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(group = %group, "interrupted, cancelling run");
            groups.cancel(&group);
        }
    });
    let result = pipeline.run(&sha, event).await;
    interrupt.abort();
    let result = result.context("Pipeline failed to run")?;

    print!("{}", render_result(&result));
    write_summaries(workspace, summary_dir, &result)?;

    if result.success {
        println!("\n✓ Pipeline passed");
        Ok(())
    } else if result.cancelled {
        anyhow::bail!("Pipeline run was cancelled")
    } else {
        anyhow::bail!("Pipeline failed")
    }
}

fn render_result(result: &PipelineResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run ID: {}\n", result.run_id));
    out.push_str(&format!(
        "Status: {}\n",
        if result.success {
            "✓ PASSED"
        } else if result.cancelled {
            "- CANCELLED"
        } else {
            "✗ FAILED"
        }
    ));
    out.push_str(&format!("Duration: {}ms\n\n", result.duration_ms));

    for stage in &result.run.stages {
        let line = match stage.status {
            StageStatus::Succeeded => format!(
                "  ✓ {} ({}ms)",
                stage.stage,
                stage.duration_ms().unwrap_or(0)
            ),
            StageStatus::Failed => format!(
                "  ✗ {} ({}ms): {}",
                stage.stage,
                stage.duration_ms().unwrap_or(0),
                stage.logs.last().map(String::as_str).unwrap_or("failed")
            ),
            StageStatus::Skipped => format!(
                "  - {} (skipped: {})",
                stage.stage,
                stage
                    .skip_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            other => format!("  ? {} ({})", stage.stage, other),
        };
        out.push_str(&line);
        out.push('\n');
    }

    if let Some(manifest) = result.run.manifest() {
        out.push_str(&format!("\nManifest: {}\n", manifest.digest));
        for tag in &manifest.tags {
            out.push_str(&format!("  {}\n", tag));
        }
    }

    out.push_str(&format!(
        "\nSummary: {}/{} stages passed, {} skipped\n",
        result.passed_count(),
        result.run.stages.len(),
        result.skipped_count()
    ));
    out.push_str(&format!(
        "Audit: {}\n",
        if result.audit.passed {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        }
    ));
    for violation in &result.audit.violations {
        out.push_str(&format!("  - {}\n", violation));
    }
    out
}

/// Write run_summary.json / run_summary.md, and append the markdown to the
/// GitHub job summary when running in Actions.
fn write_summaries(workspace: &Path, dir: Option<&Path>, result: &PipelineResult) -> Result<()> {
    let _span = RunSpan::enter(result.run_id.as_str());
    let artifact = RunSummaryArtifact::from_run(result.run_id.as_str(), &result.run, &result.reports);

    let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| {
        workspace
            .join(".quayside")
            .join("runs")
            .join(result.run_id.as_str())
    });
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    write_run_summary_json(&dir.join("run_summary.json"), &artifact)?;
    write_run_summary_md(&dir.join("run_summary.md"), &artifact)?;
    info!(dir = %dir.display(), "run summary written");

    if let Ok(path) = std::env::var("GITHUB_STEP_SUMMARY") {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {path}"))?;
        file.write_all(render_run_summary_md(&artifact).as_bytes())?;
    }
    Ok(())
}

fn render_plan(config: &PipelineConfig, event: &TriggerEvent, sha: Option<&str>) -> Result<String> {
    let gate = TriggerGate::new(config.gate.clone());
    let plan = gate.plan(event);

    let mut out = format!("Trigger: {}\n", event);
    for stage in quayside_core::StageKind::ALL {
        let mark = if plan.includes(stage) { "✓" } else { "-" };
        out.push_str(&format!("  {} {}\n", mark, stage));
    }

    if plan.includes(quayside_core::StageKind::Build) {
        match sha {
            Some(sha) => {
                out.push_str("Tags:\n");
                for tag in derive_tags(event.branch(), sha, gate.policy())? {
                    out.push_str(&format!("  {}\n", config.registry.image(&tag)?));
                }
            }
            None => out.push_str("Tags: (pass --sha to derive)\n"),
        }
    }
    Ok(out)
}

fn render_error_view(template: &str) -> Result<String> {
    let body = error_view::render(template)?;
    Ok(serde_json::to_string(&body)?)
}

// ========== Run Ledger Commands ==========

async fn cmd_runs_list(ledger: &dyn RunLedger, limit: usize) -> Result<()> {
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs.into_iter().take(limit) {
        println!(
            "{} {} {:<9} {} {} {}",
            run.created_at.to_rfc3339(),
            run.run_id,
            run.status.as_str(),
            run.metadata.pipeline,
            run.metadata.trigger,
            run.metadata
                .git_sha
                .as_deref()
                .map(|s| &s[..s.len().min(7)])
                .unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_runs_show(ledger: &dyn RunLedger, run_id: &str) -> Result<()> {
    let run_id = RunId(run_id.to_string());
    let run = ledger.get_run(&run_id).await?;
    let events = ledger.get_events(&run_id).await?;

    println!("Run ID: {}", run.run_id);
    println!("Status: {}", run.status.as_str());
    println!("Pipeline: {}", run.metadata.pipeline);
    println!("Trigger: {}", run.metadata.trigger);
    if let Some(sha) = &run.metadata.git_sha {
        println!("Commit: {}", sha);
    }
    if let Some(summary) = &run.summary {
        println!(
            "Duration: {}ms, {} events",
            summary.duration_ms, summary.total_events
        );
    }
    println!();

    for event in &events {
        println!("  {:>3} {:<24} {}", event.seq, event.kind, event.payload);
    }

    let verdict = CiGate::evaluate(&events);
    println!();
    println!("Audit: {}", verdict.message);
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(())
}

// ========== Report Commands ==========

async fn cmd_reports_show(store: &dyn ReportStore, digest: &str, min: Severity) -> Result<()> {
    let digest: ImageDigest = digest.parse()?;
    let report = store.get(&digest).await?;

    println!("Image: {} ({})", report.image_ref, report.image_digest);
    println!(
        "Scanned: {} by {}",
        report.scanned_at.to_rfc3339(),
        report.scanner
    );
    let counts = report
        .counts()
        .iter()
        .rev()
        .map(|(severity, n)| format!("{severity}={n}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("Findings: {}", if counts.is_empty() { "none".to_string() } else { counts });

    for finding in report.findings_at_least(min) {
        println!(
            "  {:<8} {:<20} {} {} -> {}",
            finding.severity.as_str(),
            finding.id,
            finding.package,
            finding.installed_version,
            finding.fixed_version.as_deref().unwrap_or("(no fix)")
        );
    }
    Ok(())
}

async fn cmd_reports_list(store: &dyn ReportStore, min: Severity) -> Result<()> {
    let reports = store.list_at_least(min).await?;
    if reports.is_empty() {
        println!("No reports with findings at or above {}", min);
        return Ok(());
    }
    for report in reports {
        println!(
            "{} {} {} finding(s), highest {}",
            report.image_digest.short(),
            report.image_ref,
            report.findings.len(),
            report
                .highest_severity()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

// ========== Deployment Commands ==========

async fn cmd_deploy_status(registry: &dyn DeploymentRegistry, environment: &str) -> Result<()> {
    match registry.current(environment).await? {
        Some(record) => println!(
            "{} runs {} ({}) since {}",
            environment,
            record.metadata.image_ref,
            record.image_digest,
            record.deployed_at.to_rfc3339()
        ),
        None => println!("Nothing deployed to {}", environment),
    }
    Ok(())
}

async fn cmd_deploy_history(registry: &dyn DeploymentRegistry, environment: &str) -> Result<()> {
    let history = registry.history(environment).await?;
    if history.is_empty() {
        println!("No deployment history for {}", environment);
        return Ok(());
    }
    for record in history {
        println!(
            "{} {} {} {}",
            record.deployed_at.to_rfc3339(),
            record.image_digest.short(),
            record.metadata.image_ref,
            record.metadata.run_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_deploy_rollback(
    registry: &dyn DeploymentRegistry,
    config: &PipelineConfig,
    environment: &str,
) -> Result<()> {
    let mut deployer = CommandDeployer::new(Arc::new(SystemExecutor), config.deploy.commands.clone());
    if let Some(secs) = config.deploy.timeout_secs {
        deployer = deployer.with_timeout(secs);
    }
    let record =
        quayside_core::rollback(registry, &deployer, &DeployTarget::new(environment)).await?;
    println!(
        "Rolled back {} -> {} ({})",
        environment, record.metadata.image_ref, record.image_digest
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use quayside_core::{deploy_image, Deployer, ImageRef};
    use quayside_state::fakes::MemoryDeploymentRegistry;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_take_precedence_over_environment() {
        let args = TriggerArgs {
            branch: Some("feature/login".to_string()),
            pr: Some(12),
            base: "main".to_string(),
        };
        let event = resolve_event(
            &args,
            Path::new("."),
            env(&[("GITHUB_EVENT_NAME", "push"), ("GITHUB_REF_NAME", "main")]),
        )
        .unwrap();
        assert_eq!(event, TriggerEvent::pull_request(12, "feature/login", "main"));
    }

    #[test]
    fn event_read_from_actions_environment() {
        let event = resolve_event(
            &TriggerArgs::default(),
            Path::new("."),
            env(&[("GITHUB_EVENT_NAME", "push"), ("GITHUB_REF_NAME", "develop")]),
        )
        .unwrap();
        assert_eq!(event, TriggerEvent::push("develop"));
    }

    #[test]
    fn no_event_outside_a_checkout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_event(&TriggerArgs::default(), dir.path(), env(&[])).unwrap_err();
        assert!(err.to_string().contains("not a git checkout"));
    }

    #[test]
    fn plan_lists_eligible_stages_and_tags() {
        let mut config = PipelineConfig::default();
        config.registry.namespace = "acme".to_string();
        config.registry.name = "shop".to_string();

        let out = render_plan(
            &config,
            &TriggerEvent::push("main"),
            Some("1a2b3c4d5e6f7a8b9c0d"),
        )
        .unwrap();
        assert!(out.contains("✓ deploy"));
        assert!(out.contains("ghcr.io/acme/shop:latest"));
        assert!(out.contains("ghcr.io/acme/shop:main-1a2b3c4"));

        let out = render_plan(
            &config,
            &TriggerEvent::pull_request(3, "fix/typo", "main"),
            None,
        )
        .unwrap();
        assert!(out.contains("✓ test"));
        assert!(out.contains("- build"));
        assert!(!out.contains("Tags"));
    }

    #[test]
    fn error_view_prints_fixed_bodies() {
        assert_eq!(
            render_error_view("404.json").unwrap(),
            r#"{"errors":{"detail":"Not Found"}}"#
        );
        assert_eq!(
            render_error_view("500.json").unwrap(),
            r#"{"errors":{"detail":"Internal Server Error"}}"#
        );
        assert!(render_error_view("404.html").is_err());
    }

    #[tokio::test]
    async fn rollback_without_commands_restores_previous_record() {
        let registry = MemoryDeploymentRegistry::new();
        let config = PipelineConfig::default();
        let target = DeployTarget::new("production");
        let deployer = CommandDeployer::new(Arc::new(SystemExecutor), Vec::new());

        for (tag, content) in [("main-1111111", b"v1"), ("main-2222222", b"v2")] {
            let image: ImageRef = format!("ghcr.io/acme/shop:{tag}").parse().unwrap();
            deploy_image(
                &registry,
                &deployer as &dyn Deployer,
                &target,
                &image,
                &ImageDigest::of_bytes(content),
                None,
            )
            .await
            .unwrap();
        }

        cmd_deploy_rollback(&registry, &config, "production")
            .await
            .unwrap();
        let current = registry.current("production").await.unwrap().unwrap();
        assert_eq!(current.image_digest, ImageDigest::of_bytes(b"v1"));
        assert_eq!(current.metadata.image_ref, "ghcr.io/acme/shop:main-1111111");
    }

    #[tokio::test]
    async fn rollback_needs_a_previous_deployment() {
        let registry = MemoryDeploymentRegistry::new();
        let err = cmd_deploy_rollback(&registry, &PipelineConfig::default(), "production").await;
        assert!(err.is_err());
    }
}
