//! Review and escalation engine (stage 6).
//!
//! Order of operations: structural pre-gate (no executor on failure),
//! checklist completion (fast model), review pass 1 (fast model), optional
//! confirmation pass 2 (hard model) driven by the blueprint's difficulty
//! tag, then a scope-routed commit whose failure never revokes approval.
//! Deep re-analysis rewrites the plan after repeated blocks.

pub mod checklist;
pub mod context_chain;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::errors::OrchestratorError;
use crate::executor::{ExecOptions, ModelTier};
use crate::pipeline::Difficulty;
use crate::repo::TaskScope;
use crate::store::execution::ExecutionRecord;
use crate::store::{CODE_REVIEW, CONTEXT, REFLECTION, RESEARCH, TASK_FILE};
use crate::{prompts, template};

/// Cap on the review reading list.
const READING_LIST_CAP: usize = 40;

/// Final verdict of a review stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    Blocked,
}

/// The pre-review structural gate. Returns the human-readable reason when
/// the record is not reviewable.
pub fn gate(record: &ExecutionRecord) -> Result<(), String> {
    if let Some(pending) = record
        .phases
        .iter()
        .find(|p| !p.status.is_completed())
    {
        return Err(format!(
            "phase '{}' is not completed",
            if pending.name.is_empty() {
                &pending.id
            } else {
                &pending.name
            }
        ));
    }
    if !record.beyond_the_basics.cleanup.all_done() {
        return Err("cleanup checklist incomplete (debug logs / formatting / dead code)".into());
    }
    Ok(())
}

/// Run the full review stage for one task.
pub async fn run_review(
    ctx: &RunContext,
    id: &str,
    cancel: &CancellationToken,
) -> Result<ReviewVerdict> {
    let store = &ctx.store;
    let record = store.read_execution(id)?;

    // Gate first; a failed gate never reaches the executor.
    if let Err(reason) = gate(&record) {
        return Err(OrchestratorError::NotReadyForReview {
            task: id.to_string(),
            reason,
        }
        .into());
    }

    let checklist = checklist::complete_checklist(ctx, id, cancel).await?;
    if checklist.total > 0 {
        ctx.logger.task(
            id,
            &format!(
                "checklist: {}/{} verified{}",
                checklist.completed,
                checklist.total,
                if checklist.success { "" } else { " (incomplete run)" }
            ),
        );
    }

    let blueprint = store.read_blueprint(id)?;
    let difficulty = Difficulty::parse(&blueprint);
    let reading_list = context_chain::reading_list(&blueprint, &record.artifacts, READING_LIST_CAP);

    ctx.logger
        .task(id, &format!("review pass 1 ({})", ModelTier::Fast.as_str()));
    run_pass(ctx, id, &blueprint, &reading_list, ModelTier::Fast, cancel).await?;
    let mut record = store.read_execution(id)?;

    let mut completed = record.is_complete();
    if completed {
        if difficulty == Difficulty::Fast {
            ctx.logger
                .task(id, "fast difficulty: skipping HARD model escalation");
        } else {
            ctx.logger
                .task(id, &format!("review pass 2 ({})", ModelTier::Hard.as_str()));
            run_pass(ctx, id, &blueprint, &reading_list, ModelTier::Hard, cancel).await?;
            record = store.read_execution(id)?;
            completed = record.is_complete();
        }
    }

    record.attempts += 1;
    if completed {
        // The approval predicate requires both the completion predicate and
        // the review flag; pin the flag so a forgetful executor cannot leave
        // an approved task unapproved on disk.
        record.completion.code_review_passed = true;
        store.write_execution(id, &record)?;
        commit_approved(ctx, id);
        ctx.logger.task(id, "review approved");
        Ok(ReviewVerdict::Approved)
    } else {
        store.write_execution(id, &record)?;
        ctx.logger.task(id, "review concluded: not completed");
        Ok(ReviewVerdict::Blocked)
    }
}

async fn run_pass(
    ctx: &RunContext,
    id: &str,
    blueprint: &str,
    reading_list: &[String],
    tier: ModelTier,
    cancel: &CancellationToken,
) -> Result<()> {
    let store = &ctx.store;
    let listing = if reading_list.is_empty() {
        "(no files listed)".to_string()
    } else {
        reading_list
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let template = template::load(&store.prompts_dir(), "review", prompts::REVIEW);
    let prompt = template::render(
        &template,
        &[
            ("task_id", id),
            ("blueprint", blueprint),
            ("reading_list", listing.as_str()),
            ("code_review_path", &store.task_path(id, CODE_REVIEW).display().to_string()),
            ("execution_path", &store.execution_path(id).display().to_string()),
        ],
    )?;

    ctx.supervisor
        .execute(
            &prompt,
            Some(id),
            cancel,
            ExecOptions {
                model: Some(tier),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// Commit the approved task's changes through the scope router. Failures
/// (including a missing scope in separate mode) are logged; the approval
/// stands and the operator can commit manually.
fn commit_approved(ctx: &RunContext, id: &str) {
    let scope = ctx
        .store
        .read_optional(id, TASK_FILE)
        .as_deref()
        .and_then(TaskScope::parse)
        .or_else(|| {
            ctx.store
                .read_optional(id, crate::store::BLUEPRINT)
                .as_deref()
                .and_then(TaskScope::parse)
        });
    let title = ctx
        .store
        .read_optional(id, TASK_FILE)
        .and_then(|body| {
            body.lines()
                .find(|l| l.trim_start().starts_with('#'))
                .map(|l| l.trim_start_matches(['#', ' ']).trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "task approved".to_string());
    let message = format!("{id}: {title}");

    match ctx
        .router()
        .commit_scoped(id, scope, &message, ctx.options.push)
    {
        Ok(lines) => {
            for line in lines {
                ctx.logger.task(id, &line);
            }
        }
        Err(err) => {
            ctx.logger
                .warn(&format!("[{id}] commit failed ({err}); task remains approved"));
        }
    }
}

/// Deep re-analysis: rewrite the plan after repeated blocks.
///
/// Requires the blueprint and execution record to exist (hard failure
/// otherwise), backs up the current plan, and runs the hard model with the
/// failure history. The executor owns the record mutations (phase resets,
/// attempts increment, forward guidance).
pub async fn reanalyze(ctx: &RunContext, id: &str, cancel: &CancellationToken) -> Result<()> {
    let store = &ctx.store;
    let blueprint = store.read_blueprint(id)?;
    let record = store.read_execution(id)?;

    if let Some(backup) = store.backup_blueprint(id)? {
        ctx.logger
            .detail(id, &format!("plan backed up to {}", backup.display()));
    }

    let recent_errors = record
        .last_errors(3)
        .iter()
        .map(|e| format!("- [{}] {}: {}", e.timestamp, e.phase, e.message))
        .collect::<Vec<_>>()
        .join("\n");
    let open_uncertainties = record
        .unresolved_uncertainties()
        .iter()
        .map(|u| format!("- {}: assumed {} (confidence {:.2})", u.topic, u.assumption, u.confidence))
        .collect::<Vec<_>>()
        .join("\n");
    let context_files = [CONTEXT, RESEARCH, REFLECTION]
        .iter()
        .filter(|name| store.task_path(id, name).exists())
        .map(|name| format!("- {}", store.task_path(id, name).display()))
        .collect::<Vec<_>>()
        .join("\n");

    let current_phase = record.current_phase_label().unwrap_or_else(|| "unknown".into());
    let template = template::load(&store.prompts_dir(), "reanalyze", prompts::REANALYZE);
    let prompt = template::render(
        &template,
        &[
            ("task_id", id),
            ("blueprint", blueprint.as_str()),
            ("current_phase", current_phase.as_str()),
            (
                "recent_errors",
                if recent_errors.is_empty() {
                    "(none recorded)"
                } else {
                    recent_errors.as_str()
                },
            ),
            (
                "open_uncertainties",
                if open_uncertainties.is_empty() {
                    "(none)"
                } else {
                    open_uncertainties.as_str()
                },
            ),
            (
                "context_files",
                if context_files.is_empty() {
                    "(none)"
                } else {
                    context_files.as_str()
                },
            ),
            ("execution_path", &store.execution_path(id).display().to_string()),
        ],
    )?;

    ctx.logger.task(
        id,
        &format!("re-analysis after {} attempts (hard model)", record.attempts),
    );
    ctx.supervisor
        .execute(
            &prompt,
            Some(id),
            cancel,
            ExecOptions {
                model: Some(ModelTier::Hard),
                ..Default::default()
            },
        )
        .await?;

    let after = store.read_execution(id)?;
    if record.is_blocked() && !after.is_blocked() {
        ctx.logger.task(id, "re-analysis unblocked the task");
    } else if after.is_blocked() {
        ctx.logger.task(id, "task is still blocked after re-analysis");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RunContext, RunOptions};
    use crate::errors::as_orchestrator_error;
    use crate::executor::ExecutorKind;
    use crate::store::BLUEPRINT;
    use crate::store::execution::{
        BeyondTheBasics, Cleanup, Completion, CompletionStatus, PhaseEntry, PhaseStatus,
        TaskStatus,
    };
    use std::path::Path;
    use std::sync::Arc;

    fn ctx_with(cmd: &str, dir: &Path) -> Arc<RunContext> {
        RunContext::initialize(
            dir.to_path_buf(),
            ExecutorKind::Custom(cmd.into()),
            RunOptions::default(),
            None,
        )
        .unwrap()
    }

    /// Write an executable script that first drains stdin, then runs `body`.
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn reviewable_record() -> ExecutionRecord {
        ExecutionRecord {
            status: TaskStatus::Completed,
            attempts: 1,
            phases: vec![PhaseEntry {
                id: "p1".into(),
                name: "build it".into(),
                status: PhaseStatus::Completed,
                extra: Default::default(),
            }],
            completion: Completion {
                status: CompletionStatus::Completed,
                ..Default::default()
            },
            beyond_the_basics: BeyondTheBasics {
                cleanup: Cleanup {
                    debug_logs_removed: true,
                    formatting_consistent: true,
                    dead_code_removed: true,
                    extra: Default::default(),
                },
                extra: Default::default(),
            },
            ..Default::default()
        }
    }

    fn seed_task(ctx: &RunContext, id: &str, difficulty: &str, record: &ExecutionRecord) {
        ctx.store
            .write_task_doc(id, TASK_FILE, "@dependencies none\n# Build the thing\n")
            .unwrap();
        ctx.store
            .write_task_doc(
                id,
                BLUEPRINT,
                &format!(
                    "# {id}\n\n## 1. IDENTITY\n@difficulty {difficulty}\n\n## 2. CONTEXT CHAIN\n- src/lib.rs\n"
                ),
            )
            .unwrap();
        ctx.store.write_execution(id, record).unwrap();
    }

    #[test]
    fn gate_requires_completed_phases_and_cleanup() {
        let mut record = reviewable_record();
        assert!(gate(&record).is_ok());

        record.phases[0].status = PhaseStatus::InProgress;
        let reason = gate(&record).unwrap_err();
        assert!(reason.contains("build it"));

        record.phases[0].status = PhaseStatus::Completed;
        record.beyond_the_basics.cleanup.formatting_consistent = false;
        let reason = gate(&record).unwrap_err();
        assert!(reason.contains("cleanup"));
    }

    #[tokio::test]
    async fn failed_gate_never_invokes_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        // The executor command would exit non-zero if it ran at all.
        let ctx = ctx_with("false", dir.path());
        let mut record = reviewable_record();
        record.beyond_the_basics.cleanup.dead_code_removed = false;
        seed_task(&ctx, "TASK1", "medium", &record);

        let err = run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap_err();
        let typed = as_orchestrator_error(&err).unwrap();
        assert!(matches!(typed, OrchestratorError::NotReadyForReview { .. }));
    }

    #[tokio::test]
    async fn fast_difficulty_runs_one_pass_and_skips_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let count_file = dir.path().join("invocations");
        let cmd = script(
            dir.path(),
            "exec.sh",
            &format!("echo pass >> {}", count_file.display()),
        );
        let ctx = ctx_with(&cmd, dir.path());
        seed_task(&ctx, "TASK1", "fast", &reviewable_record());

        let verdict = run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, ReviewVerdict::Approved);

        let invocations = std::fs::read_to_string(&count_file).unwrap();
        assert_eq!(invocations.lines().count(), 1);

        let log = std::fs::read_to_string(ctx.store.log_file()).unwrap();
        assert!(log.contains("skipping HARD model escalation"));
    }

    #[tokio::test]
    async fn medium_difficulty_escalates_to_a_second_pass() {
        let dir = tempfile::tempdir().unwrap();
        let count_file = dir.path().join("invocations");
        let cmd = script(
            dir.path(),
            "exec.sh",
            &format!("echo pass >> {}", count_file.display()),
        );
        let ctx = ctx_with(&cmd, dir.path());
        seed_task(&ctx, "TASK1", "medium", &reviewable_record());

        let verdict = run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, ReviewVerdict::Approved);

        let invocations = std::fs::read_to_string(&count_file).unwrap();
        assert_eq!(invocations.lines().count(), 2);
    }

    #[tokio::test]
    async fn approved_review_pins_the_review_flag_and_counts_an_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "exec.sh", "true");
        let ctx = ctx_with(&cmd, dir.path());
        seed_task(&ctx, "TASK1", "fast", &reviewable_record());

        run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();

        let record = ctx.store.read_execution("TASK1").unwrap();
        assert!(record.completion.code_review_passed);
        assert_eq!(record.attempts, 2);
        assert!(ctx.store.is_approved("TASK1"));
    }

    #[tokio::test]
    async fn pass_marking_task_blocked_yields_blocked_without_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let count_file = dir.path().join("invocations");

        // Prepare the record the fake reviewer will install: blocked.
        let blocked = ExecutionRecord {
            status: TaskStatus::Blocked,
            ..reviewable_record()
        };
        let blocked_path = dir.path().join("blocked.json");
        std::fs::write(&blocked_path, serde_json::to_string(&blocked).unwrap()).unwrap();

        let ctx = ctx_with("cat", dir.path());
        seed_task(&ctx, "TASK1", "medium", &reviewable_record());
        let cmd = script(
            dir.path(),
            "exec.sh",
            &format!(
                "echo pass >> {}\ncp {} {}",
                count_file.display(),
                blocked_path.display(),
                ctx.store.execution_path("TASK1").display()
            ),
        );
        let ctx = ctx_with(&cmd, dir.path());

        let verdict = run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, ReviewVerdict::Blocked);
        // Pass 1 concluded not-completed, so there is no pass 2.
        let invocations = std::fs::read_to_string(&count_file).unwrap();
        assert_eq!(invocations.lines().count(), 1);
        assert!(!ctx.store.is_approved("TASK1"));
    }

    #[tokio::test]
    async fn commit_failure_does_not_revoke_approval() {
        // The workspace is not a git repository, so the commit fails.
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "exec.sh", "true");
        let ctx = ctx_with(&cmd, dir.path());
        seed_task(&ctx, "TASK1", "fast", &reviewable_record());

        let verdict = run_review(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, ReviewVerdict::Approved);

        let log = std::fs::read_to_string(ctx.store.log_file()).unwrap();
        assert!(log.contains("commit failed"));
        assert!(log.contains("task remains approved"));
    }

    #[tokio::test]
    async fn reanalyze_requires_blueprint_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with("cat", dir.path());
        ctx.store
            .write_task_doc("TASK1", TASK_FILE, "@dependencies none\n")
            .unwrap();
        let err = reanalyze(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap_err();
        let typed = as_orchestrator_error(&err).unwrap();
        assert!(matches!(typed, OrchestratorError::StateMissing { .. }));
    }

    #[tokio::test]
    async fn reanalyze_backs_up_the_plan_and_logs_unblocking() {
        let dir = tempfile::tempdir().unwrap();

        let unblocked = ExecutionRecord {
            status: TaskStatus::Pending,
            attempts: 4,
            ..ExecutionRecord::skeleton()
        };
        let unblocked_path = dir.path().join("unblocked.json");
        std::fs::write(&unblocked_path, serde_json::to_string(&unblocked).unwrap()).unwrap();

        let staging = ctx_with("cat", dir.path());
        let mut record = reviewable_record();
        record.status = TaskStatus::Blocked;
        record.attempts = 3;
        record.record_error("p1", "segfault in integration test");
        seed_task(&staging, "TASK1", "medium", &record);

        let cmd = script(
            dir.path(),
            "exec.sh",
            &format!(
                "cp {} {}",
                unblocked_path.display(),
                staging.store.execution_path("TASK1").display()
            ),
        );
        let ctx = ctx_with(&cmd, dir.path());

        reanalyze(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();

        // The prior plan was backed up.
        let backups: Vec<_> = std::fs::read_dir(ctx.store.task_dir("TASK1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("TODO.old."))
            .collect();
        assert_eq!(backups.len(), 1);

        let log = std::fs::read_to_string(ctx.store.log_file()).unwrap();
        assert!(log.contains("re-analysis unblocked the task"));
    }
}
