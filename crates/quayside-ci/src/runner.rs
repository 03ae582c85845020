//! External command execution.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::CiError;
use crate::stage::StageCommand;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 = killed by signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    pub success: bool,
}

impl CommandOutput {
    /// Whether the command passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            success: false,
            ..Default::default()
        }
    }
}

/// Runs stage commands. Swapped for a scripted executor in tests.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the command to completion. A non-zero exit is an `Ok` output;
    /// only spawn failures and timeouts are errors.
    async fn run(&self, command: &StageCommand) -> Result<CommandOutput, CiError>;
}

/// Run `command` and turn a non-zero exit into [`CiError::CommandFailed`].
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    command: &StageCommand,
) -> Result<CommandOutput, CiError> {
    let output = executor.run(command).await?;
    if !output.passed() {
        return Err(CiError::CommandFailed {
            stage: command.name.clone(),
            exit_code: output.exit_code,
            stderr: last_lines(&output.stderr, 20),
        });
    }
    Ok(output)
}

/// Tail of a command's output for stage logs.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Spawns real processes with `tokio::process`.
///
/// Children are killed when the returned future is dropped, so a cancelled
/// stage does not leave its command running.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, config: &StageCommand) -> Result<CommandOutput, CiError> {
        let start = Instant::now();

        let (exe, args) = config
            .command
            .split_first()
            .ok_or_else(|| CiError::EmptyCommand {
                stage: config.name.clone(),
            })?;

        debug!(stage = %config.name, command = %config.display(), "spawning");

        let mut cmd = Command::new(exe);
        let stdin = if config.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        cmd.args(args)
            .envs(&config.env)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| CiError::Spawn {
            program: exe.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (&config.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // Dropping the pipe closes stdin.
        }

        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| CiError::Timeout {
                stage: config.name.clone(),
                secs: config.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
