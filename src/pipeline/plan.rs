//! Stage 4: blueprint planning and the split decision.
//!
//! Planning produces BLUEPRINT.md and the execution.json skeleton for one
//! task, or replaces the task with numbered subtask folders. A split
//! invalidates the task graph; the scheduler rebuilds it from disk.

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::dag::builder::declared_deps;
use crate::executor::{ExecOptions, ModelTier};
use crate::store::execution::ExecutionRecord;
use crate::store::{AI_PROMPT, BLUEPRINT};
use crate::{prompts, template};

/// How planning left the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Blueprint and execution skeleton exist; implementation can start.
    Planned,
    /// The folder was replaced by subtasks; the graph must be rebuilt.
    Split,
}

/// Run the planning stage for one task.
pub async fn run_plan(
    ctx: &RunContext,
    id: &str,
    cancel: &CancellationToken,
) -> Result<PlanOutcome> {
    let store = &ctx.store;
    let task_file = store.read_task_file(id)?;
    let spec = std::fs::read_to_string(store.run_file(AI_PROMPT)).unwrap_or_default();
    let dependency_context = dependency_context(ctx, &task_file);

    let template = template::load(&store.prompts_dir(), "plan", prompts::PLAN);
    let prompt = template::render(
        &template,
        &[
            ("task_id", id),
            ("task_file", task_file.as_str()),
            ("spec", spec.as_str()),
            ("dependency_context", dependency_context.as_str()),
            ("task_dir", &store.task_dir(id).display().to_string()),
        ],
    )?;

    ctx.logger.task(id, "planning blueprint");
    ctx.supervisor
        .execute(
            &prompt,
            Some(id),
            cancel,
            ExecOptions {
                model: Some(ModelTier::Medium),
                ..Default::default()
            },
        )
        .await?;

    // Split detection: the folder no longer exists but subtasks do.
    if !store.task_exists(id) {
        let subtasks = store.subtasks_of(id)?;
        if subtasks.is_empty() {
            bail!("planning removed {id} without creating subtasks");
        }
        ctx.logger
            .task(id, &format!("split into {}", subtasks.join(", ")));
        return Ok(PlanOutcome::Split);
    }

    if !store.task_path(id, BLUEPRINT).exists() {
        bail!("planning did not produce BLUEPRINT.md for {id}");
    }

    // The skeleton is the orchestrator's responsibility when the executor
    // stops at the blueprint.
    if !store.execution_exists(id) {
        store.write_execution(id, &ExecutionRecord::skeleton())?;
        ctx.logger.detail(id, "wrote execution.json skeleton");
    }

    Ok(PlanOutcome::Planned)
}

/// Summaries and forward guidance from this task's approved dependencies.
fn dependency_context(ctx: &RunContext, task_file: &str) -> String {
    let deps = declared_deps(task_file).unwrap_or_default();
    let mut out = String::new();
    for dep in deps {
        let Ok(Some(record)) = ctx.store.try_read_execution(&dep) else {
            continue;
        };
        if !record.is_complete() {
            continue;
        }
        out.push_str(&format!("### {dep}\n"));
        for line in &record.completion.summary {
            out.push_str(&format!("- {line}\n"));
        }
        for line in &record.completion.for_future_tasks {
            out.push_str(&format!("- note for later tasks: {line}\n"));
        }
    }
    if out.is_empty() {
        out.push_str("(no completed dependencies)\n");
    }
    out
}
