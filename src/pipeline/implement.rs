//! Stage 5: implementation.
//!
//! The executor works through the blueprint's contract, keeping
//! execution.json current. The orchestrator accounts attempts after the
//! fact (cancellation never counts), guarantees CONTEXT.md exists, and may
//! fire the reflection hook that feeds lessons to future tasks.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::errors::as_orchestrator_error;
use crate::executor::ExecOptions;
use crate::pipeline::Difficulty;
use crate::store::execution::ExecutionRecord;
use crate::store::{CONTEXT, REFLECTION};
use crate::{prompts, template};

/// Error-history length that triggers a reflection entry.
const REFLECT_ERROR_THRESHOLD: usize = 3;
/// Attempt count that triggers a reflection entry.
const REFLECT_ATTEMPT_THRESHOLD: u32 = 2;
/// Artifact volume that marks a change as large enough to reflect on.
const REFLECT_ARTIFACT_THRESHOLD: usize = 12;
/// Upper bound on cross-task context embedded in the prompt.
const CROSS_CONTEXT_MAX_CHARS: usize = 8_000;

/// Run one implementation pass for a task.
pub async fn run_implement(ctx: &RunContext, id: &str, cancel: &CancellationToken) -> Result<()> {
    let store = &ctx.store;
    let blueprint = store.read_blueprint(id)?;
    let record = store.read_execution(id)?;
    let execution_json = serde_json::to_string_pretty(&record)?;
    let cross_context = cross_task_context(ctx, id);

    let template = template::load(&store.prompts_dir(), "implement", prompts::IMPLEMENT);
    let prompt = template::render(
        &template,
        &[
            ("task_id", id),
            ("blueprint", blueprint.as_str()),
            ("execution", execution_json.as_str()),
            ("cross_context", cross_context.as_str()),
            ("task_dir", &store.task_dir(id).display().to_string()),
        ],
    )?;

    let tier = Difficulty::parse(&blueprint).tier();
    ctx.logger.task(
        id,
        &format!("implementation attempt {} ({})", record.attempts + 1, tier.as_str()),
    );

    let result = ctx
        .supervisor
        .execute(
            &prompt,
            Some(id),
            cancel,
            ExecOptions {
                model: Some(tier),
                ..Default::default()
            },
        )
        .await;

    match result {
        Ok(_) => {
            let mut updated = store.read_execution(id)?;
            updated.attempts += 1;
            store.write_execution(id, &updated)?;

            if store.read_optional(id, CONTEXT).is_none() {
                store.write_task_doc(
                    id,
                    CONTEXT,
                    &format!("# Context for {id}\n\n(no context recorded yet)\n"),
                )?;
            }
            maybe_reflect(ctx, id, &updated)?;
            Ok(())
        }
        Err(err) => {
            if let Some(typed) = as_orchestrator_error(&err) {
                if typed.is_cancelled() {
                    // Cancellation leaves the record untouched.
                    return Err(err);
                }
            }
            // A failed executor run is still a counted attempt.
            if let Ok(Some(mut updated)) = store.try_read_execution(id) {
                updated.attempts += 1;
                updated.record_error("implementation", &err.to_string());
                store.write_execution(id, &updated)?;
            }
            Err(err)
        }
    }
}

/// Guidance accumulated by completed tasks: completion notes first, then
/// reflection lessons, bounded to keep the prompt in check.
fn cross_task_context(ctx: &RunContext, current: &str) -> String {
    let mut out = String::new();
    let Ok(tasks) = ctx.store.list_tasks() else {
        return out;
    };
    for other in tasks {
        if other == current {
            continue;
        }
        let Ok(Some(record)) = ctx.store.try_read_execution(&other) else {
            continue;
        };
        if !record.is_complete() {
            continue;
        }
        let mut section = String::new();
        for line in &record.completion.for_future_tasks {
            section.push_str(&format!("- {line}\n"));
        }
        for line in record.completion.summary.iter().take(3) {
            section.push_str(&format!("- done: {line}\n"));
        }
        if let Some(reflection) = ctx.store.read_optional(&other, REFLECTION) {
            for line in reflection.lines().filter(|l| l.starts_with("- ")).take(5) {
                section.push_str(line);
                section.push('\n');
            }
        }
        if !section.is_empty() {
            out.push_str(&format!("### {other}\n{section}"));
        }
        if out.len() > CROSS_CONTEXT_MAX_CHARS {
            out.truncate(crate::util::floor_char_boundary(&out, CROSS_CONTEXT_MAX_CHARS));
            out.push_str("\n(truncated)\n");
            break;
        }
    }
    if out.is_empty() {
        out.push_str("(no completed tasks yet)\n");
    }
    out
}

/// The reflection hook: after a heavy pass, distill structured lessons into
/// REFLECTION.md. Heuristic by design and cheap enough to never hold up the
/// scheduler.
fn maybe_reflect(ctx: &RunContext, id: &str, record: &ExecutionRecord) -> Result<()> {
    let heavy = record.attempts >= REFLECT_ATTEMPT_THRESHOLD
        || record.error_history.len() >= REFLECT_ERROR_THRESHOLD
        || record.artifacts.len() >= REFLECT_ARTIFACT_THRESHOLD;
    if !heavy {
        return Ok(());
    }

    let mut entry = format!(
        "## Lessons after attempt {} ({})\n",
        record.attempts,
        chrono::Utc::now().to_rfc3339()
    );
    for err in record.last_errors(3) {
        entry.push_str(&format!("- failure in {}: {}\n", err.phase, err.message));
    }
    for u in record.unresolved_uncertainties() {
        entry.push_str(&format!(
            "- unresolved: {} (assumed: {}, confidence {:.2})\n",
            u.topic, u.assumption, u.confidence
        ));
    }
    if record.artifacts.len() >= REFLECT_ARTIFACT_THRESHOLD {
        entry.push_str(&format!(
            "- large change surface: {} artifacts touched\n",
            record.artifacts.len()
        ));
    }

    let existing = ctx.store.read_optional(id, REFLECTION).unwrap_or_default();
    ctx.store
        .write_task_doc(id, REFLECTION, &format!("{existing}{entry}\n"))?;
    ctx.logger.detail(id, "reflection lessons recorded");
    Ok(())
}
