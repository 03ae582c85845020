//! Command-driven deployer.

use std::sync::Arc;

use async_trait::async_trait;
use quayside_core::{DeployTarget, Deployer, ImageRef, QuaysideError, StageKind};
use quayside_state::ImageDigest;
use tracing::info;

use crate::runner::{run_checked, CommandExecutor};
use crate::stage::StageCommand;

/// Runs the configured deployment commands.
///
/// Arguments may contain `{image}`, `{digest}`, `{pinned}` and
/// `{environment}`. With no commands configured the deployment is only
/// recorded.
pub struct CommandDeployer {
    executor: Arc<dyn CommandExecutor>,
    commands: Vec<Vec<String>>,
    timeout_secs: u64,
}

impl CommandDeployer {
    pub fn new(executor: Arc<dyn CommandExecutor>, commands: Vec<Vec<String>>) -> Self {
        Self {
            executor,
            commands,
            timeout_secs: StageKind::Deploy.default_timeout().as_secs(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn render(
        &self,
        args: &[String],
        target: &DeployTarget,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> Vec<String> {
        let image_str = image.to_string();
        let pinned = image.pinned(digest);
        args.iter()
            .map(|a| {
                a.replace("{image}", &image_str)
                    .replace("{digest}", digest.as_str())
                    .replace("{pinned}", &pinned)
                    .replace("{environment}", &target.environment)
            })
            .collect()
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn apply(
        &self,
        target: &DeployTarget,
        image: &ImageRef,
        digest: &ImageDigest,
    ) -> quayside_core::Result<()> {
        if self.commands.is_empty() {
            info!(environment = %target.environment, "no deploy commands configured");
            return Ok(());
        }

        for args in &self.commands {
            let rendered = self.render(args, target, image, digest);
            let cmd = StageCommand::new(
                format!("deploy to {}", target.environment),
                rendered,
                self.timeout_secs,
            )
            .with_env("QUAYSIDE_ENVIRONMENT", target.environment.clone());
            run_checked(self.executor.as_ref(), &cmd)
                .await
                .map_err(|e| QuaysideError::Deploy(e.to_string()))?;
        }
        Ok(())
    }
}
