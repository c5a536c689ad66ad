//! Git operations and multi-repository commit routing.
//!
//! The git interface is deliberately narrow: stage-and-commit, status, diff
//! against a base branch, branch creation, push. Commits happen either after
//! a single task's approval or in the finalizer, so they serialize by
//! construction. Push shells out to `git`; a push failure is logged by the
//! caller and never revokes an approval.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use git2::{DiffFormat, DiffOptions, IndexAddOption, Repository, Signature};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::store::{MULTI_REPO, StateStore};

/// How the run's repositories are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepoMode {
    #[default]
    Monorepo,
    Separate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Repositories {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<PathBuf>,
}

/// Persisted multi-repository configuration (`multi-repo.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MultiRepoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: RepoMode,
    #[serde(default)]
    pub repositories: Repositories,
    #[serde(default)]
    pub git_roots: Vec<PathBuf>,
}

impl MultiRepoConfig {
    /// Build from `--backend`/`--frontend` CLI paths.
    pub fn from_paths(backend: PathBuf, frontend: PathBuf) -> Self {
        let mode = if backend == frontend {
            RepoMode::Monorepo
        } else {
            RepoMode::Separate
        };
        let mut git_roots = vec![backend.clone()];
        if frontend != backend {
            git_roots.push(frontend.clone());
        }
        Self {
            enabled: true,
            mode,
            repositories: Repositories {
                backend: Some(backend),
                frontend: Some(frontend),
            },
            git_roots,
        }
    }

    pub fn load(store: &StateStore) -> Result<Option<Self>> {
        let path = store.run_file(MULTI_REPO);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self, store: &StateStore) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize multi-repo config")?;
        let path = store.run_file(MULTI_REPO);
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Task scope tag routing commits to the correct repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    Backend,
    Frontend,
    Integration,
}

impl TaskScope {
    /// Extract an `@scope <value>` tag from task or blueprint text.
    pub fn parse(text: &str) -> Option<Self> {
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("@scope") {
                return match rest.trim().to_ascii_lowercase().as_str() {
                    "backend" => Some(Self::Backend),
                    "frontend" => Some(Self::Frontend),
                    "integration" => Some(Self::Integration),
                    _ => None,
                };
            }
        }
        None
    }
}

/// Thin wrapper over one git repository.
pub struct GitOps {
    repo: Repository,
    workdir: PathBuf,
}

impl GitOps {
    pub fn open(dir: &Path) -> Result<Self> {
        let repo = Repository::open(dir)
            .with_context(|| format!("Failed to open git repository at {}", dir.display()))?;
        Ok(Self {
            repo,
            workdir: dir.to_path_buf(),
        })
    }

    /// Whether the working tree has anything to commit.
    pub fn has_changes(&self) -> Result<bool> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;
        Ok(!statuses.is_empty())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Name of the currently checked-out branch, if HEAD is on one.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        head.shorthand().map(str::to_string)
    }

    /// Stage everything and commit. Returns the new commit id, or `None`
    /// when there was nothing to commit.
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        if !self.has_changes()? {
            return Ok(None);
        }
        let mut index = self.repo.index().context("Failed to open git index")?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .context("Failed to stage changes")?;
        index.write().context("Failed to write git index")?;

        let tree_id = index.write_tree().context("Failed to write git tree")?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("maestro", "maestro@localhost")?;

        let commit_id = match self.head_commit() {
            Some(parent) => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
            // Unborn branch: this commit becomes the root.
            None => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };
        Ok(Some(commit_id.to_string()))
    }

    /// Create a branch at HEAD and check it out.
    pub fn create_branch(&self, name: &str) -> Result<()> {
        let head = self
            .head_commit()
            .context("Cannot create a branch on an unborn HEAD")?;
        self.repo
            .branch(name, &head, false)
            .with_context(|| format!("Failed to create branch {name}"))?;
        self.repo
            .set_head(&format!("refs/heads/{name}"))
            .with_context(|| format!("Failed to switch to branch {name}"))?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.safe();
        self.repo
            .checkout_head(Some(&mut checkout))
            .context("Failed to check out new branch")?;
        Ok(())
    }

    /// Unified diff of the working tree (plus index) against a base branch,
    /// or against HEAD when no base is given.
    pub fn diff_text(&self, base_branch: Option<&str>) -> Result<String> {
        let base_tree = match base_branch {
            Some(name) => {
                let reference = self
                    .repo
                    .find_reference(&format!("refs/heads/{name}"))
                    .with_context(|| format!("Base branch {name} not found"))?;
                Some(reference.peel_to_tree()?)
            }
            None => self.head_commit().map(|c| c.tree()).transpose()?,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(base_tree.as_ref(), Some(&mut opts))
            .context("Failed to compute diff")?;

        let mut buf = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => buf.push(line.origin()),
                _ => {}
            }
            buf.push_str(&String::from_utf8_lossy(line.content()));
            true
        })
        .context("Failed to render diff")?;
        Ok(buf)
    }

    /// Push the current branch. Shells out: the narrow interface does not
    /// model remotes or credentials.
    pub fn push(&self) -> Result<()> {
        let output = std::process::Command::new("git")
            .args(["push", "--set-upstream", "origin", "HEAD"])
            .current_dir(&self.workdir)
            .output()
            .context("Failed to run git push")?;
        if !output.status.success() {
            bail!(
                "git push failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Scope-aware commit routing.
pub struct CommitRouter<'a> {
    workspace: &'a Path,
    multi_repo: Option<&'a MultiRepoConfig>,
}

impl<'a> CommitRouter<'a> {
    pub fn new(workspace: &'a Path, multi_repo: Option<&'a MultiRepoConfig>) -> Self {
        Self {
            workspace,
            multi_repo,
        }
    }

    /// The ordered list of repositories to commit in, per the routing table:
    /// single-repo and monorepo runs commit once; separate mode commits in
    /// the scoped repository, integration scope in backend then frontend.
    pub fn targets(&self, task_id: &str, scope: Option<TaskScope>) -> Result<Vec<PathBuf>> {
        let Some(config) = self.multi_repo.filter(|c| c.enabled) else {
            return Ok(vec![self.workspace.to_path_buf()]);
        };
        if config.mode == RepoMode::Monorepo {
            let root = config
                .git_roots
                .first()
                .cloned()
                .unwrap_or_else(|| self.workspace.to_path_buf());
            return Ok(vec![root]);
        }

        let scope = scope.ok_or_else(|| OrchestratorError::ScopeRequired {
            task: task_id.to_string(),
        })?;
        let backend = config.repositories.backend.clone();
        let frontend = config.repositories.frontend.clone();
        let targets = match scope {
            TaskScope::Backend => vec![backend],
            TaskScope::Frontend => vec![frontend],
            TaskScope::Integration => vec![backend, frontend],
        };
        let targets: Vec<PathBuf> = targets.into_iter().flatten().collect();
        if targets.is_empty() {
            bail!("multi-repo config has no repository paths for scope routing");
        }
        Ok(targets)
    }

    /// Commit (and optionally push) in every routed repository, in order.
    /// Returns one log line per repository that received a commit.
    pub fn commit_scoped(
        &self,
        task_id: &str,
        scope: Option<TaskScope>,
        message: &str,
        push: bool,
    ) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for cwd in self.targets(task_id, scope)? {
            let git = GitOps::open(&cwd)?;
            match git.commit(message)? {
                Some(sha) => {
                    let mut line = format!(
                        "committed {} in {} ({})",
                        &sha[..sha.len().min(8)],
                        cwd.display(),
                        message
                    );
                    // A failed push never blocks the remaining repositories.
                    if push {
                        if let Err(err) = git.push() {
                            line.push_str(&format!(" [push failed: {err}]"));
                        }
                    }
                    lines.push(line);
                }
                None => lines.push(format!("nothing to commit in {}", cwd.display())),
            }
        }
        Ok(lines)
    }
}
