//! Test stage: ephemeral database, cached dependency install, test suite.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use quayside_core::{StageKind, TestConfig};
use tracing::{info, warn};

use crate::cache::DependencyCache;
use crate::database::{EphemeralDatabase, PendingTeardowns, TeardownGuard};
use crate::error::CiError;
use crate::runner::{last_lines, run_checked, CommandExecutor};
use crate::stage::StageCommand;

/// Runs the project's automated test suite.
#[async_trait]
pub trait TestSuite: Send + Sync {
    /// Run the suite, returning log lines. Any error fails the stage.
    async fn run_suite(&self) -> Result<Vec<String>, CiError>;

    /// Finish cleanup left behind by a suite run that was dropped part way.
    async fn settle(&self) {}
}

/// Test suite driven by configured commands.
pub struct CommandTestSuite {
    executor: Arc<dyn CommandExecutor>,
    config: TestConfig,
    database: Option<EphemeralDatabase>,
    cache: DependencyCache,
    workdir: PathBuf,
    pending: PendingTeardowns,
}

impl CommandTestSuite {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        config: TestConfig,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        let workdir = workdir.into();
        let cache = DependencyCache::new(workdir.join(&config.cache_dir))
            .with_paths(config.cache_paths.clone());
        Self {
            executor,
            config,
            database: None,
            cache,
            workdir,
            pending: PendingTeardowns::default(),
        }
    }

    pub fn with_database(mut self, database: EphemeralDatabase) -> Self {
        self.database = Some(database);
        self
    }

    fn timeout_secs(&self) -> u64 {
        self.config
            .timeout_secs
            .unwrap_or_else(|| StageKind::Test.default_timeout().as_secs())
    }

    /// Runtime pins and the test-environment marker.
    pub fn base_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("MIX_ENV".to_string(), self.config.mix_env.clone()),
            (
                "ELIXIR_VERSION".to_string(),
                self.config.elixir_version.clone(),
            ),
            ("OTP_VERSION".to_string(), self.config.otp_version.clone()),
        ])
    }

    fn command(&self, args: &[String], env: &BTreeMap<String, String>) -> StageCommand {
        StageCommand::new(args.join(" "), args.iter().cloned(), self.timeout_secs())
            .with_envs(env)
            .in_dir(&self.workdir)
    }

    async fn install_and_test(
        &self,
        env: &BTreeMap<String, String>,
        logs: &mut Vec<String>,
    ) -> Result<(), CiError> {
        let pins = [
            ("elixir", self.config.elixir_version.as_str()),
            ("otp", self.config.otp_version.as_str()),
            ("mix_env", self.config.mix_env.as_str()),
        ];
        let key =
            DependencyCache::key_for(&self.workdir.join(&self.config.lockfile), &pins).await?;

        if self.cache.is_warm(&key).await {
            let files = self.cache.restore(&key, &self.workdir).await?;
            info!(key = %&key[..12], files, "dependency cache hit");
            logs.push(format!("dependency cache hit ({}, {files} files)", &key[..12]));
        } else {
            for args in &self.config.install_commands {
                let out = run_checked(self.executor.as_ref(), &self.command(args, env)).await?;
                logs.push(format!("{} ({}ms)", args.join(" "), out.duration_ms));
            }
            let files = self.cache.save(&key, &self.workdir).await?;
            logs.push(format!("dependency cache stored ({}, {files} files)", &key[..12]));
        }

        let out = run_checked(
            self.executor.as_ref(),
            &self.command(&self.config.test_command, env),
        )
        .await?;
        let tail = last_lines(&out.stdout, 5);
        if !tail.is_empty() {
            logs.push(tail);
        }
        Ok(())
    }
}

#[async_trait]
impl TestSuite for CommandTestSuite {
    async fn run_suite(&self) -> Result<Vec<String>, CiError> {
        let mut logs = Vec::new();
        let mut env = self.base_env();

        let guard = match &self.database {
            Some(db) => {
                let guard = TeardownGuard::new(db.clone(), self.executor.clone(), self.pending.clone());
                if let Err(e) = db.provision(self.executor.as_ref()).await {
                    if let Err(te) = guard.teardown().await {
                        warn!(error = %te, "database teardown failed");
                    }
                    return Err(e);
                }
                env.extend(db.connection_env());
                logs.push(format!("database {} ready", db.container_name()));
                Some(guard)
            }
            None => None,
        };

        let result = self.install_and_test(&env, &mut logs).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.teardown().await {
                warn!(error = %e, "database teardown failed");
            }
        }
        result.map(|_| logs)
    }

    async fn settle(&self) {
        self.pending.settle().await;
    }
}
