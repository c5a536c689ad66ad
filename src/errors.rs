//! Typed error hierarchy for the maestro orchestrator.
//!
//! One top-level enum covers the orchestration taxonomy; most functions
//! return `anyhow::Result` and attach one of these kinds where callers need
//! to match on the failure (scheduler outcomes, exit codes, retry policy).

use thiserror::Error;

/// Errors with orchestration-level meaning.
///
/// The scheduler is the propagation boundary: worker errors become task
/// outcomes and never unwind sibling workers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A required state file is absent (e.g. execution.json past planning).
    #[error("Missing state for {task}: {file} does not exist")]
    StateMissing { task: String, file: String },

    /// A required state file exists but cannot be parsed.
    #[error("Malformed state for {task} at {path}: {reason}")]
    MalformedState {
        task: String,
        path: std::path::PathBuf,
        reason: String,
    },

    /// The pre-review structural gate failed; the task stays in an earlier
    /// stage and the executor is never invoked.
    #[error("Task {task} is not ready for review: {reason}")]
    NotReadyForReview { task: String, reason: String },

    /// The executor subprocess exited non-zero.
    #[error("Executor exited with code {code}")]
    ExecutorFailed { code: i32 },

    /// Cooperative cancellation fired while the executor was running.
    /// Does not count as a failed attempt.
    #[error("Executor invocation was cancelled")]
    ExecutorCancelled,

    /// Multi-repo mode requires a task scope to route the commit.
    #[error("Task {task} has no @scope tag but multi-repo mode is separate")]
    ScopeRequired { task: String },

    /// The task graph contains a cycle; the run aborts.
    #[error("Cycle detected in task dependencies involving: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    /// One or more tasks lack a @dependencies line; the graph cannot be
    /// built until dependency assignment runs.
    #[error("Tasks missing @dependencies: {}", tasks.join(", "))]
    DependenciesIncomplete { tasks: Vec<String> },

    /// The task exceeded its attempt budget and is terminally blocked.
    #[error("Task {task} exhausted its attempt budget ({attempts} attempts)")]
    AttemptsExhausted { task: String, attempts: u32 },

    /// The critical-bug sweep did not pass within its iteration budget.
    #[error("Critical review did not pass after {iterations} iterations")]
    FinalReviewExhausted { iterations: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether this failure is cancellation rather than an error proper.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ExecutorCancelled)
    }

    /// Process exit code for a run that terminates on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CycleDetected { .. } => 2,
            Self::ScopeRequired { .. } => 3,
            Self::FinalReviewExhausted { .. } => 4,
            Self::ExecutorCancelled => 130,
            _ => 1,
        }
    }
}

/// Look for an `OrchestratorError` anywhere in an anyhow chain.
pub fn as_orchestrator_error(err: &anyhow::Error) -> Option<&OrchestratorError> {
    err.chain()
        .find_map(|e| e.downcast_ref::<OrchestratorError>())
}
