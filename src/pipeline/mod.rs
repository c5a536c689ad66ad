//! The per-task stage pipeline.
//!
//! A task's current stage is a pure function of which files exist in its
//! folder (blueprint, execution record, review verdict, approval); no stage
//! counter is stored, which makes every invocation resumable. Each stage
//! runs the executor at most once, then returns to the scheduler, which
//! decides whether to invoke the task again.

pub mod bootstrap;
pub mod decompose;
pub mod implement;
pub mod plan;

use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::errors::{OrchestratorError, as_orchestrator_error};
use crate::executor::ModelTier;
use crate::review;
use crate::store::execution::ExecutionRecord;

/// The steady-state stages a scheduled task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    /// Blueprint and/or execution skeleton still missing (stage 4).
    Plan,
    /// Execution record exists but the work is not complete (stage 5).
    Implement,
    /// Work reads complete and the review gate holds (stage 6).
    Review,
    /// Approved; nothing left to do.
    Done,
}

impl TaskStage {
    pub fn number(&self) -> u8 {
        match self {
            Self::Plan => 4,
            Self::Implement => 5,
            Self::Review => 6,
            Self::Done => 6,
        }
    }
}

/// Outcome of one worker step, consumed by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Review approved the task; the graph node completes.
    Approved,
    /// A stage ran; schedule the task again on a later wave.
    InProgress,
    /// Review concluded the task is blocked; retried, and re-analysis may
    /// fire on a later wave.
    StillBlocked,
    /// The task folder was replaced by subtasks; the graph must be rebuilt.
    Split,
    /// The current stage is excluded by a `--steps` restriction.
    Skipped,
    /// Cancellation fired mid-stage; not counted as an attempt.
    Cancelled,
    /// The stage failed recoverably; the scheduler may retry.
    Failed(String),
    /// Unrecoverable for this task (malformed or missing required state).
    Fatal(String),
}

/// Infer a task's stage from its on-disk artifacts.
pub fn detect_stage(ctx: &RunContext, id: &str) -> anyhow::Result<TaskStage> {
    let store = &ctx.store;
    if !store.task_path(id, crate::store::BLUEPRINT).exists()
        || !store.execution_exists(id)
    {
        return Ok(TaskStage::Plan);
    }
    if store.is_approved(id) {
        return Ok(TaskStage::Done);
    }
    let record = store.read_execution(id)?;
    if record.is_complete() && review::gate(&record).is_ok() {
        return Ok(TaskStage::Review);
    }
    Ok(TaskStage::Implement)
}

/// Blueprint difficulty tag, driving executor model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Difficulty {
    Fast,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    /// Extract an `@difficulty <value>` tag; absent or unrecognized values
    /// fall back to medium.
    pub fn parse(text: &str) -> Self {
        for line in text.lines() {
            if let Some(rest) = line.trim().strip_prefix("@difficulty") {
                return match rest.trim().to_ascii_lowercase().as_str() {
                    "fast" => Self::Fast,
                    "hard" => Self::Hard,
                    _ => Self::Medium,
                };
            }
        }
        Self::Medium
    }

    pub fn tier(&self) -> ModelTier {
        match self {
            Self::Fast => ModelTier::Fast,
            Self::Medium => ModelTier::Medium,
            Self::Hard => ModelTier::Hard,
        }
    }
}

/// Whether a blocked record is due for deep re-analysis. Zero attempts never
/// trigger; the condition is `attempts > 0 && attempts % 3 == 0`.
pub fn due_for_reanalysis(record: &ExecutionRecord) -> bool {
    record.is_blocked() && record.attempts > 0 && record.attempts % 3 == 0
}

/// Run the next stage for one task and translate the result into a
/// scheduler outcome. Errors never escape: they become task outcomes at
/// this boundary.
pub async fn run_next_stage(
    ctx: &RunContext,
    id: &str,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let stage = match detect_stage(ctx, id) {
        Ok(stage) => stage,
        Err(err) => return outcome_from_error(err),
    };
    if !ctx.step_enabled(stage.number()) {
        return TaskOutcome::Skipped;
    }

    match stage {
        TaskStage::Done => TaskOutcome::Approved,

        TaskStage::Plan => match plan::run_plan(ctx, id, cancel).await {
            Ok(plan::PlanOutcome::Planned) => TaskOutcome::InProgress,
            Ok(plan::PlanOutcome::Split) => TaskOutcome::Split,
            Err(err) => outcome_from_error(err),
        },

        TaskStage::Implement => {
            // Repeated blocks trigger a blueprint rewrite before the next
            // implementation pass.
            match ctx.store.read_execution(id) {
                Ok(record) if due_for_reanalysis(&record) => {
                    return match review::reanalyze(ctx, id, cancel).await {
                        Ok(()) => TaskOutcome::InProgress,
                        Err(err) => outcome_from_error(err),
                    };
                }
                Ok(_) => {}
                Err(err) => return outcome_from_error(err),
            }
            match implement::run_implement(ctx, id, cancel).await {
                Ok(()) => TaskOutcome::InProgress,
                Err(err) => outcome_from_error(err),
            }
        }

        TaskStage::Review => match review::run_review(ctx, id, cancel).await {
            Ok(review::ReviewVerdict::Approved) => TaskOutcome::Approved,
            Ok(review::ReviewVerdict::Blocked) => TaskOutcome::StillBlocked,
            Err(err) => outcome_from_error(err),
        },
    }
}

fn outcome_from_error(err: anyhow::Error) -> TaskOutcome {
    match as_orchestrator_error(&err) {
        Some(OrchestratorError::ExecutorCancelled) => TaskOutcome::Cancelled,
        Some(OrchestratorError::MalformedState { .. })
        | Some(OrchestratorError::StateMissing { .. }) => TaskOutcome::Fatal(err.to_string()),
        Some(OrchestratorError::NotReadyForReview { .. }) => {
            // The gate failed between detection and review; the task simply
            // stays in the implementation stage.
            TaskOutcome::InProgress
        }
        _ => TaskOutcome::Failed(err.to_string()),
    }
}
