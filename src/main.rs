use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use console::style;
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;

use maestro::context::{
    DEFAULT_ATTEMPT_LIMIT, DEFAULT_MAX_CONCURRENT, DEFAULT_SWEEP_ITERATIONS, RunContext,
    RunOptions,
};
use maestro::dag::DagExecutor;
use maestro::errors::{OrchestratorError, as_orchestrator_error};
use maestro::executor::ExecutorKind;
use maestro::finalize::run_finalizer;
use maestro::pipeline::bootstrap::{BootstrapOutcome, run_bootstrap, run_clarify};
use maestro::pipeline::decompose::{ensure_dependencies, run_decompose};
use maestro::repo::GitOps;
use maestro::store::{AI_PROMPT, StateStore};

#[derive(Parser)]
#[command(name = "maestro")]
#[command(version, about = "Autonomous software engineering orchestrator")]
struct Cli {
    /// Seed prompt for a new run
    #[arg(long)]
    prompt: Option<String>,

    /// Resume after clarification answers are provided
    #[arg(long = "continue")]
    continue_run: bool,

    /// Discard state and start a new run
    #[arg(long)]
    fresh: bool,

    /// Push after commit points (--push=false to disable)
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    push: bool,

    /// Skip branch creation; work on the current branch
    #[arg(long)]
    same_branch: bool,

    /// Attempt budget per task
    #[arg(long, default_value_t = DEFAULT_ATTEMPT_LIMIT)]
    limit: u32,

    /// Remove the per-task attempt budget
    #[arg(long)]
    no_limit: bool,

    /// Scheduler concurrency cap
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Restrict execution to these stage numbers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    steps: Option<Vec<u8>>,

    /// Restrict execution to a single stage number
    #[arg(long, conflicts_with = "steps")]
    step: Option<u8>,

    /// Backend repository path (enables multi-repo mode with --frontend)
    #[arg(long, requires = "frontend")]
    backend: Option<PathBuf>,

    /// Frontend repository path (enables multi-repo mode with --backend)
    #[arg(long, requires = "backend")]
    frontend: Option<PathBuf>,

    /// Use the codex executor backend instead of claude
    #[arg(long)]
    codex: bool,

    /// Iteration budget for the final critical-bug sweep
    #[arg(long, default_value_t = DEFAULT_SWEEP_ITERATIONS)]
    sweep_iterations: u32,

    /// Workspace directory (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Answer yes to confirmation prompts
    #[arg(long)]
    yes: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            let code = as_orchestrator_error(&err)
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code.clamp(1, 255) as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if cli.fresh {
        confirm_and_reset(&workspace, cli.yes)?;
    }

    let options = RunOptions {
        prompt: cli.prompt.clone(),
        continue_run: cli.continue_run,
        push: cli.push,
        same_branch: cli.same_branch,
        attempt_limit: if cli.no_limit { None } else { Some(cli.limit) },
        max_concurrent: cli.max_concurrent,
        steps: cli.step.map(|s| vec![s]).or(cli.steps.clone()),
        sweep_iterations: cli.sweep_iterations,
        verbose: cli.verbose,
    };
    let executor = if cli.codex {
        ExecutorKind::Codex
    } else {
        ExecutorKind::Claude
    };
    let repo_paths = cli.backend.clone().zip(cli.frontend.clone());
    let ctx = RunContext::initialize(workspace, executor, options, repo_paths)?;

    // Idempotent completion: a finished run exits immediately.
    if ctx.store.has_completion_marker() {
        ctx.logger
            .info("run already complete (done.txt present); use --fresh to start over");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    // Paused for clarification: exit cleanly until the operator answers.
    if ctx.store.has_pending_clarification() && !cli.continue_run {
        ctx.logger.info(
            "clarification pending; write CLARIFICATION_ANSWERS.json and re-run with --continue",
        );
        return Ok(ExitCode::SUCCESS);
    }

    if cli.continue_run && ctx.step_enabled(1) {
        run_clarify(&ctx, &cancel).await?;
    }

    if !ctx.store.run_file(AI_PROMPT).exists() {
        if !ctx.step_enabled(0) {
            bail!("no run specification exists and stage 0 is excluded by --steps");
        }
        maybe_create_run_branch(&ctx);
        match run_bootstrap(&ctx, &cancel).await? {
            BootstrapOutcome::Paused => return Ok(ExitCode::SUCCESS),
            BootstrapOutcome::Ready => {}
        }
    }

    if ctx.store.list_tasks()?.is_empty() {
        if !ctx.step_enabled(2) {
            bail!("no tasks exist and stage 2 is excluded by --steps");
        }
        run_decompose(&ctx, &cancel).await?;
    }

    if ctx.step_enabled(3) {
        ensure_dependencies(&ctx, &cancel).await?;
    }

    let summary = DagExecutor::new(ctx.clone(), cancel.clone()).run().await?;
    if summary.cancelled {
        ctx.logger.info("run cancelled; partial state persisted");
        return Err(OrchestratorError::ExecutorCancelled.into());
    }
    if !summary.success {
        let report = summary.report();
        if summary.exhausted.is_empty() && summary.fatal.is_empty() && !summary.skipped.is_empty()
        {
            // A --steps restriction legitimately leaves work behind.
            ctx.logger.info(&format!("partial run finished: {report}"));
            return Ok(ExitCode::SUCCESS);
        }
        ctx.logger.error(&report);
        return Ok(ExitCode::FAILURE);
    }
    ctx.logger.info(&summary.report());

    run_finalizer(&ctx, &cancel).await?;
    Ok(ExitCode::SUCCESS)
}

/// `--fresh`: wipe run state, confirming first when the prior run is
/// unfinished.
fn confirm_and_reset(workspace: &std::path::Path, assume_yes: bool) -> Result<()> {
    let store = StateStore::new(workspace);
    if !store.is_initialized() {
        return Ok(());
    }
    let unfinished = !store.has_completion_marker() && !store.list_tasks()?.is_empty();
    if unfinished && !assume_yes {
        let proceed = Confirm::new()
            .with_prompt("The previous run is unfinished. Discard its state?")
            .default(false)
            .interact()
            .context("confirmation required (pass --yes to skip)")?;
        if !proceed {
            bail!("aborted; previous run state kept");
        }
    }
    store.reset()
}

/// Create a run branch unless the operator opted out or the workspace is not
/// a repository on a born branch. Failure is logged, never fatal.
fn maybe_create_run_branch(ctx: &RunContext) {
    if ctx.options.same_branch {
        return;
    }
    let Ok(git) = GitOps::open(&ctx.workspace) else {
        return;
    };
    let name = format!("maestro/run-{}", maestro::util::timestamp_slug());
    match git.create_branch(&name) {
        Ok(()) => ctx.logger.info(&format!("created run branch {name}")),
        Err(err) => ctx
            .logger
            .warn(&format!("could not create run branch ({err}); staying put")),
    }
}
