//! Executor supervisor: runs the opaque AI executor subprocess.
//!
//! The supervisor is indifferent to which backend is selected (a run-wide
//! setting). It delivers the prompt through a per-invocation file, streams
//! the line-delimited JSON protocol from stdout, routes extracted messages
//! to the run logger and per-task buffers, and surfaces exit failures and
//! cancellation as typed errors. Retry and attempt accounting belong to the
//! caller; concurrent invocations are independent.

pub mod stream;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::OrchestratorError;
use crate::logger::RunLogger;
use crate::util::first_line_snippet;
use self::stream::{ExecutorEvent, digest_line};

/// Which executor binary the supervisor invokes. Run-wide setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorKind {
    Claude,
    Codex,
    /// Arbitrary command line, used by tests and the
    /// `MAESTRO_EXECUTOR_CMD` escape hatch.
    Custom(String),
}

impl ExecutorKind {
    /// Resolve from CLI selection, honoring the environment override.
    pub fn resolve(selected: Self) -> Self {
        match std::env::var("MAESTRO_EXECUTOR_CMD") {
            Ok(cmd) if !cmd.trim().is_empty() => Self::Custom(cmd),
            _ => selected,
        }
    }

    /// Program plus base arguments for one invocation.
    fn command_line(&self) -> (String, Vec<String>) {
        match self {
            Self::Claude => (
                "claude".to_string(),
                [
                    "--print",
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--dangerously-skip-permissions",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            Self::Codex => (
                "codex".to_string(),
                ["exec", "--json"].iter().map(|s| s.to_string()).collect(),
            ),
            Self::Custom(cmd) => {
                let mut parts = cmd.split_whitespace().map(str::to_string);
                let program = parts.next().unwrap_or_else(|| "sh".to_string());
                (program, parts.collect())
            }
        }
    }

    /// Extra arguments selecting a model tier, where the backend supports it.
    fn model_args(&self, tier: ModelTier) -> Vec<String> {
        match self {
            Self::Claude => vec![
                "--model".to_string(),
                match tier {
                    ModelTier::Fast => "haiku",
                    ModelTier::Medium => "sonnet",
                    ModelTier::Hard => "opus",
                }
                .to_string(),
            ],
            Self::Codex => vec![
                "-c".to_string(),
                format!(
                    "model_reasoning_effort={}",
                    match tier {
                        ModelTier::Fast => "low",
                        ModelTier::Medium => "medium",
                        ModelTier::Hard => "high",
                    }
                ),
            ],
            Self::Custom(_) => Vec::new(),
        }
    }
}

/// Escalation tiers for executor model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Fast,
    Medium,
    Hard,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub model: Option<ModelTier>,
    pub cwd: Option<PathBuf>,
    /// Optional wall-clock bound; exceeding it is `ExecutorFailed`.
    pub timeout: Option<Duration>,
}

/// Result of one successful executor invocation.
#[derive(Debug)]
pub struct ExecOutput {
    /// Accumulated message text (the result frame's text when present).
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
}

pub struct Supervisor {
    kind: ExecutorKind,
    logger: Arc<RunLogger>,
    logs_dir: PathBuf,
    default_cwd: PathBuf,
}

impl Supervisor {
    pub fn new(
        kind: ExecutorKind,
        logger: Arc<RunLogger>,
        logs_dir: PathBuf,
        default_cwd: PathBuf,
    ) -> Self {
        Self {
            kind,
            logger,
            logs_dir,
            default_cwd,
        }
    }

    /// Run the executor once with the given prompt.
    ///
    /// Fails with `ExecutorFailed{code}` on a non-zero exit and with
    /// `ExecutorCancelled` when `cancel` fires first. Not idempotent.
    pub async fn execute(
        &self,
        prompt: &str,
        task_id: Option<&str>,
        cancel: &CancellationToken,
        opts: ExecOptions,
    ) -> Result<ExecOutput> {
        let scope = task_id.unwrap_or("run");
        let start = Instant::now();

        // Prompt goes through a file: executor prompts routinely exceed what
        // argv can carry, and the file doubles as the invocation log.
        std::fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("Failed to create {}", self.logs_dir.display()))?;
        let stamp = crate::util::timestamp_slug();
        let prompt_file = self.logs_dir.join(format!("{scope}-{stamp}-prompt.md"));
        let output_file = self.logs_dir.join(format!("{scope}-{stamp}-output.log"));
        std::fs::write(&prompt_file, prompt)
            .with_context(|| format!("Failed to write {}", prompt_file.display()))?;

        let (program, mut args) = self.kind.command_line();
        if let Some(tier) = opts.model {
            args.extend(self.kind.model_args(tier));
        }
        let cwd = opts.cwd.clone().unwrap_or_else(|| self.default_cwd.clone());

        self.logger.detail(
            scope,
            &format!(
                "spawning {} {} (model: {})",
                program,
                args.join(" "),
                opts.model.map(|m| m.as_str()).unwrap_or("default")
            ),
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&cwd)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn executor process '{program}'"))?;

        // Feed stdin from its own task: a large prompt must not deadlock
        // against our stdout reads, and an executor that exits without
        // reading stdin surfaces as its exit code, not as a pipe error here.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt_bytes = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                stdin.write_all(&prompt_bytes).await.ok();
                stdin.shutdown().await.ok();
            })
        });

        // Drain stderr concurrently so a chatty executor cannot fill the pipe
        // and deadlock against our stdout reader.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture executor stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut result_is_error = false;

        loop {
            let next = async {
                lines.next_line().await
            };
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    child.kill().await.ok();
                    self.logger.task(scope, "executor cancelled");
                    return Err(OrchestratorError::ExecutorCancelled.into());
                }
                _ = sleep_until_opt(deadline) => {
                    child.kill().await.ok();
                    self.logger.task(scope, "executor timed out");
                    return Err(OrchestratorError::ExecutorFailed { code: 124 }.into());
                }
                line = next => line.context("Failed to read executor stdout")?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            for event in digest_line(&line) {
                match event {
                    ExecutorEvent::Message(text) => {
                        let snippet = first_line_snippet(&text, 72);
                        if !snippet.is_empty() {
                            self.logger.detail(scope, &snippet);
                        }
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                    ExecutorEvent::Activity(desc) => self.logger.detail(scope, &desc),
                    ExecutorEvent::Result { text, is_error } => {
                        final_result = text;
                        result_is_error = is_error;
                    }
                    ExecutorEvent::Raw(text) => {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for executor")?;
        if let Some(handle) = stdin_task {
            handle.await.ok();
        }
        let exit_code = status.code().unwrap_or(-1);
        let duration = start.elapsed();

        let output = final_result.unwrap_or(accumulated);
        std::fs::write(&output_file, &output)
            .with_context(|| format!("Failed to write {}", output_file.display()))?;

        if result_is_error {
            self.logger.task(scope, "executor reported an error result");
        }
        self.logger.detail(
            scope,
            &format!("executor finished in {:.1}s (exit {exit_code})", duration.as_secs_f64()),
        );

        if !status.success() {
            if let Some(handle) = stderr_task {
                if let Ok(stderr_text) = handle.await {
                    let snippet = first_line_snippet(&stderr_text, 160);
                    if !snippet.is_empty() {
                        self.logger.task(scope, &format!("executor stderr: {snippet}"));
                    }
                }
            }
            return Err(OrchestratorError::ExecutorFailed { code: exit_code }.into());
        }
        if let Some(handle) = stderr_task {
            handle.abort();
        }

        Ok(ExecOutput {
            output,
            exit_code,
            duration,
        })
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
