//! Filesystem state store for a run.
//!
//! All orchestrator state lives under the workspace's coordination directory
//! (`.maestro/`). The layout is a shared contract with the external executor,
//! so every path is constructed here and nowhere else. Orchestrator-owned
//! writes are atomic (write to a temporary sibling, rename into place);
//! executor-owned writes are re-validated on every read instead.

pub mod execution;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::OrchestratorError;
use crate::util;
use self::execution::ExecutionRecord;

/// Name of the hidden coordination directory under the workspace.
pub const COORD_DIR: &str = ".maestro";

// Run-level documents.
pub const AI_PROMPT: &str = "AI_PROMPT.md";
pub const INITIAL_PROMPT: &str = "INITIAL_PROMPT.md";
pub const CLARIFICATION_QUESTIONS: &str = "CLARIFICATION_QUESTIONS.json";
pub const CLARIFICATION_ANSWERS: &str = "CLARIFICATION_ANSWERS.json";
pub const PENDING_CLARIFICATION: &str = "PENDING_CLARIFICATION.flag";
pub const MULTI_REPO: &str = "multi-repo.json";
pub const BUGS: &str = "BUGS.md";
pub const CRITICAL_REVIEW_PASSED: &str = "CRITICAL_REVIEW_PASSED.md";
pub const COMPLETION_MARKER: &str = "done.txt";
pub const LOG_FILE: &str = "log.txt";

// Per-task documents.
pub const TASK_FILE: &str = "TASK.md";
pub const BLUEPRINT: &str = "BLUEPRINT.md";
pub const EXECUTION: &str = "execution.json";
pub const REVIEW_CHECKLIST: &str = "review-checklist.json";
pub const CODE_REVIEW: &str = "CODE_REVIEW.md";
pub const CONTEXT: &str = "CONTEXT.md";
pub const RESEARCH: &str = "RESEARCH.md";
pub const REFLECTION: &str = "REFLECTION.md";
pub const SPLIT_MARKER: &str = "split.txt";

/// Handle over one run's on-disk state.
#[derive(Debug, Clone)]
pub struct StateStore {
    workspace: PathBuf,
    coord: PathBuf,
}

impl StateStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let coord = workspace.join(COORD_DIR);
        Self { workspace, coord }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn coord_dir(&self) -> &Path {
        &self.coord
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.coord.join("logs")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.coord.join("prompts")
    }

    pub fn run_file(&self, name: &str) -> PathBuf {
        self.coord.join(name)
    }

    pub fn log_file(&self) -> PathBuf {
        self.coord.join(LOG_FILE)
    }

    /// Create the coordination directory skeleton. Idempotent.
    pub fn init(&self) -> Result<()> {
        for dir in [self.coord.clone(), self.logs_dir(), self.prompts_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.coord.exists()
    }

    /// Remove all run state. Used by `--fresh` after operator confirmation.
    pub fn reset(&self) -> Result<()> {
        if self.coord.exists() {
            fs::remove_dir_all(&self.coord).with_context(|| {
                format!(
                    "Failed to remove coordination directory: {}",
                    self.coord.display()
                )
            })?;
        }
        Ok(())
    }

    // ---- task folders ----

    pub fn task_dir(&self, id: &str) -> PathBuf {
        self.coord.join(id)
    }

    pub fn task_path(&self, id: &str, name: &str) -> PathBuf {
        self.task_dir(id).join(name)
    }

    pub fn task_exists(&self, id: &str) -> bool {
        self.task_dir(id).is_dir()
    }

    /// All task ids present on disk, sorted by numeric id components.
    pub fn list_tasks(&self) -> Result<Vec<String>> {
        if !self.coord.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.coord)
            .with_context(|| format!("Failed to read {}", self.coord.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if util::is_task_id(&name) {
                ids.push(name);
            }
        }
        ids.sort_by(|a, b| util::compare_ids(a, b));
        Ok(ids)
    }

    /// Existing subtask ids of `id`, at any depth, sorted.
    pub fn subtasks_of(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| util::is_subtask_of(t, id))
            .collect())
    }

    // ---- execution records ----

    pub fn execution_path(&self, id: &str) -> PathBuf {
        self.task_path(id, EXECUTION)
    }

    pub fn execution_exists(&self, id: &str) -> bool {
        self.execution_path(id).exists()
    }

    /// Read a task's execution record.
    ///
    /// Missing file is `StateMissing`; an unparseable file is
    /// `MalformedState` (the executor writes this file directly, so a
    /// half-written record must surface as a task-scoped failure).
    pub fn read_execution(&self, id: &str) -> Result<ExecutionRecord> {
        let path = self.execution_path(id);
        if !path.exists() {
            return Err(OrchestratorError::StateMissing {
                task: id.to_string(),
                file: EXECUTION.to_string(),
            }
            .into());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::MalformedState {
                task: id.to_string(),
                path,
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Like `read_execution` but maps a missing file to `None`.
    pub fn try_read_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        if !self.execution_exists(id) {
            return Ok(None);
        }
        self.read_execution(id).map(Some)
    }

    /// Atomically write a task's execution record.
    pub fn write_execution(&self, id: &str, record: &ExecutionRecord) -> Result<()> {
        let path = self.execution_path(id);
        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize execution record")?;
        self.write_atomic(&path, &json)
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
        Ok(())
    }

    // ---- task documents ----

    pub fn read_task_file(&self, id: &str) -> Result<String> {
        self.read_required(id, TASK_FILE)
    }

    pub fn read_blueprint(&self, id: &str) -> Result<String> {
        self.read_required(id, BLUEPRINT)
    }

    fn read_required(&self, id: &str, name: &str) -> Result<String> {
        let path = self.task_path(id, name);
        if !path.exists() {
            return Err(OrchestratorError::StateMissing {
                task: id.to_string(),
                file: name.to_string(),
            }
            .into());
        }
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Read an optional per-task document, `None` when absent.
    pub fn read_optional(&self, id: &str, name: &str) -> Option<String> {
        fs::read_to_string(self.task_path(id, name)).ok()
    }

    pub fn write_task_doc(&self, id: &str, name: &str, content: &str) -> Result<()> {
        let dir = self.task_dir(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        self.write_atomic(&self.task_path(id, name), content)
    }

    /// Back up the current blueprint before re-analysis rewrites the plan.
    /// Returns the backup path, or `None` when no blueprint exists.
    pub fn backup_blueprint(&self, id: &str) -> Result<Option<PathBuf>> {
        let src = self.task_path(id, BLUEPRINT);
        if !src.exists() {
            return Ok(None);
        }
        let backup = self
            .task_dir(id)
            .join(format!("TODO.old.{}.md", util::timestamp_slug()));
        fs::copy(&src, &backup)
            .with_context(|| format!("Failed to back up {}", src.display()))?;
        Ok(Some(backup))
    }

    // ---- approval ----

    /// Whether `CODE_REVIEW.md` carries an approved status: the first
    /// non-blank line after a `## Status` heading contains "approved"
    /// (case-insensitive).
    pub fn has_approved_review(&self, id: &str) -> bool {
        let Some(content) = self.read_optional(id, CODE_REVIEW) else {
            return false;
        };
        let mut in_status = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("## ") {
                in_status = trimmed[3..].trim().eq_ignore_ascii_case("status");
                continue;
            }
            if in_status && !trimmed.is_empty() {
                return trimmed.to_ascii_lowercase().contains("approved");
            }
        }
        false
    }

    /// The approval predicate: the execution record satisfies the completion
    /// predicate and the executor reported the code review as passed.
    pub fn is_approved(&self, id: &str) -> bool {
        match self.try_read_execution(id) {
            Ok(Some(record)) => record.is_complete() && record.completion.code_review_passed,
            _ => false,
        }
    }

    // ---- markers ----

    pub fn has_completion_marker(&self) -> bool {
        self.run_file(COMPLETION_MARKER).exists()
    }

    /// Idempotent completion marker; written once, subsequent invocations
    /// exit immediately when present.
    pub fn write_completion_marker(&self) -> Result<()> {
        let path = self.run_file(COMPLETION_MARKER);
        if path.exists() {
            return Ok(());
        }
        self.write_atomic(
            &path,
            &format!("completed at {}\n", chrono::Utc::now().to_rfc3339()),
        )
    }

    pub fn has_critical_review_marker(&self) -> bool {
        self.run_file(CRITICAL_REVIEW_PASSED).exists()
    }

    pub fn has_pending_clarification(&self) -> bool {
        self.run_file(PENDING_CLARIFICATION).exists()
    }

    pub fn set_pending_clarification(&self) -> Result<()> {
        self.write_atomic(&self.run_file(PENDING_CLARIFICATION), "pending\n")
    }

    pub fn clear_pending_clarification(&self) -> Result<()> {
        let path = self.run_file(PENDING_CLARIFICATION);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn has_split_marker(&self, id: &str) -> bool {
        self.task_path(id, SPLIT_MARKER).exists()
    }

    pub fn write_split_marker(&self, id: &str) -> Result<()> {
        self.write_task_doc(id, SPLIT_MARKER, "split decision taken\n")
    }
}
