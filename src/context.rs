//! Run-wide context shared by every subsystem.
//!
//! Built once at startup from CLI arguments plus persisted configuration and
//! never mutated afterwards; multi-repo setup from the CLI is the one
//! explicit reconfigure entry point (it persists the config for later runs).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::executor::{ExecutorKind, Supervisor};
use crate::logger::RunLogger;
use crate::repo::{CommitRouter, GitOps, MultiRepoConfig};
use crate::store::StateStore;

/// Default per-task attempt budget.
pub const DEFAULT_ATTEMPT_LIMIT: u32 = 20;
/// Default scheduler concurrency cap.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
/// Default iteration budget for the final critical-bug sweep.
pub const DEFAULT_SWEEP_ITERATIONS: u32 = 3;

/// Options resolved from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub prompt: Option<String>,
    pub continue_run: bool,
    pub push: bool,
    pub same_branch: bool,
    /// `None` means unlimited (`--no-limit`).
    pub attempt_limit: Option<u32>,
    pub max_concurrent: usize,
    /// Restrict execution to these stage numbers; `None` runs everything.
    pub steps: Option<Vec<u8>>,
    pub sweep_iterations: u32,
    pub verbose: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prompt: None,
            continue_run: false,
            push: true,
            same_branch: false,
            attempt_limit: Some(DEFAULT_ATTEMPT_LIMIT),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            steps: None,
            sweep_iterations: DEFAULT_SWEEP_ITERATIONS,
            verbose: false,
        }
    }
}

/// Everything a stage needs, passed by reference.
pub struct RunContext {
    pub workspace: PathBuf,
    pub store: StateStore,
    pub logger: Arc<RunLogger>,
    pub supervisor: Supervisor,
    pub options: RunOptions,
    pub multi_repo: Option<MultiRepoConfig>,
    /// Branch the run started from; the finalizer diffs against it.
    pub base_branch: Option<String>,
}

impl RunContext {
    /// Initialize the run context: create the coordination directory, wire
    /// the logger and supervisor, and resolve multi-repo configuration (CLI
    /// paths win and are persisted; otherwise the stored file is loaded).
    pub fn initialize(
        workspace: PathBuf,
        executor: ExecutorKind,
        options: RunOptions,
        repo_paths: Option<(PathBuf, PathBuf)>,
    ) -> Result<Arc<Self>> {
        let workspace = workspace
            .canonicalize()
            .context("Failed to resolve workspace directory")?;
        let store = StateStore::new(&workspace);
        store.init()?;

        let logger = Arc::new(RunLogger::new(store.log_file(), options.verbose));

        let multi_repo = match repo_paths {
            Some((backend, frontend)) => {
                let config = MultiRepoConfig::from_paths(backend, frontend);
                config.save(&store)?;
                Some(config)
            }
            None => MultiRepoConfig::load(&store)?,
        };

        let base_branch = GitOps::open(&workspace)
            .ok()
            .and_then(|git| git.current_branch());

        let supervisor = Supervisor::new(
            ExecutorKind::resolve(executor),
            logger.clone(),
            store.logs_dir(),
            workspace.clone(),
        );

        Ok(Arc::new(Self {
            workspace,
            store,
            logger,
            supervisor,
            options,
            multi_repo,
            base_branch,
        }))
    }

    /// Whether a `--steps`/`--step` restriction allows this stage number.
    pub fn step_enabled(&self, stage: u8) -> bool {
        match &self.options.steps {
            Some(steps) => steps.contains(&stage),
            None => true,
        }
    }

    pub fn router(&self) -> CommitRouter<'_> {
        CommitRouter::new(&self.workspace, self.multi_repo.as_ref())
    }
}
