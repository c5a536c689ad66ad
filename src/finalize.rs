//! Finalizer: the global critical-bug sweep, the final commit, and the
//! idempotent completion marker. Runs only once every task is approved.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::errors::{OrchestratorError, as_orchestrator_error};
use crate::executor::{ExecOptions, ModelTier};
use crate::repo::GitOps;
use crate::store::{BUGS, CRITICAL_REVIEW_PASSED};
use crate::{prompts, template};

/// Upper bound on diff text embedded in the sweep prompt.
const DIFF_MAX_CHARS: usize = 120_000;

/// Run the finalizer to completion.
///
/// The sweep loops up to the configured iteration budget; the pass criterion
/// is solely the presence of the terminal marker file. Exhausting the budget
/// is `FinalReviewExhausted` and the run exits non-zero.
pub async fn run_finalizer(ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
    let store = &ctx.store;
    if store.has_completion_marker() {
        return Ok(());
    }

    if !store.has_critical_review_marker() {
        let budget = ctx.options.sweep_iterations.max(1);
        let bugs_path = store.run_file(BUGS).display().to_string();
        let marker_path = store.run_file(CRITICAL_REVIEW_PASSED).display().to_string();

        for iteration in 1..=budget {
            ctx.logger
                .info(&format!("critical-bug sweep {iteration}/{budget}"));

            let diff = cumulative_diff(ctx);
            let tpl =
                template::load(&store.prompts_dir(), "critical_review", prompts::CRITICAL_REVIEW);
            let prompt = template::render(
                &tpl,
                &[
                    ("diff", diff.as_str()),
                    ("bugs_path", bugs_path.as_str()),
                    ("marker_path", marker_path.as_str()),
                ],
            )?;

            let result = ctx
                .supervisor
                .execute(
                    &prompt,
                    None,
                    cancel,
                    ExecOptions {
                        model: Some(ModelTier::Hard),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(err) = result {
                if let Some(typed) = as_orchestrator_error(&err) {
                    if typed.is_cancelled() {
                        return Err(err);
                    }
                }
                ctx.logger
                    .warn(&format!("sweep iteration {iteration} failed: {err}"));
            }

            if store.has_critical_review_marker() {
                ctx.logger.info("critical review passed");
                break;
            }
        }

        if !store.has_critical_review_marker() {
            return Err(OrchestratorError::FinalReviewExhausted { iterations: budget }.into());
        }
    }

    final_commit(ctx);
    store.write_completion_marker()?;
    ctx.logger.info("run complete; completion marker written");
    Ok(())
}

/// Repositories the run touches: multi-repo git roots, or the workspace.
fn git_roots(ctx: &RunContext) -> Vec<std::path::PathBuf> {
    match ctx.multi_repo.as_ref().filter(|c| c.enabled) {
        Some(config) if !config.git_roots.is_empty() => config.git_roots.clone(),
        _ => vec![ctx.workspace.clone()],
    }
}

/// Cumulative diff across every git root, against the base branch where the
/// run recorded one.
fn cumulative_diff(ctx: &RunContext) -> String {
    let mut out = String::new();
    for root in git_roots(ctx) {
        let header = format!("## {}\n", root.display());
        match GitOps::open(&root) {
            Ok(git) => {
                let base = if root == ctx.workspace {
                    ctx.base_branch.as_deref()
                } else {
                    None
                };
                match git.diff_text(base).or_else(|_| git.diff_text(None)) {
                    Ok(diff) if diff.trim().is_empty() => {
                        out.push_str(&header);
                        out.push_str("(no changes)\n");
                    }
                    Ok(diff) => {
                        out.push_str(&header);
                        out.push_str(&diff);
                        out.push('\n');
                    }
                    Err(err) => {
                        out.push_str(&header);
                        out.push_str(&format!("(diff unavailable: {err})\n"));
                    }
                }
            }
            Err(err) => {
                out.push_str(&header);
                out.push_str(&format!("(not a git repository: {err})\n"));
            }
        }
        if out.len() > DIFF_MAX_CHARS {
            out.truncate(crate::util::floor_char_boundary(&out, DIFF_MAX_CHARS));
            out.push_str("\n(diff truncated)\n");
            break;
        }
    }
    out
}

/// Commit and optionally push in every git root. Failures are logged; the
/// completion marker is still written so the run stays idempotent.
fn final_commit(ctx: &RunContext) {
    for root in git_roots(ctx) {
        match GitOps::open(&root) {
            Ok(git) => match git.commit("finalize orchestrated run") {
                Ok(Some(sha)) => {
                    ctx.logger.info(&format!(
                        "final commit {} in {}",
                        &sha[..sha.len().min(8)],
                        root.display()
                    ));
                    if ctx.options.push {
                        if let Err(err) = git.push() {
                            ctx.logger.warn(&format!("final push failed: {err}"));
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => ctx
                    .logger
                    .warn(&format!("final commit failed in {}: {err}", root.display())),
            },
            Err(err) => ctx
                .logger
                .warn(&format!("{} is not a git repository: {err}", root.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RunContext, RunOptions};
    use crate::executor::ExecutorKind;
    use std::path::Path;
    use std::sync::Arc;

    fn ctx_with(cmd: &str, dir: &Path, sweep_iterations: u32) -> Arc<RunContext> {
        RunContext::initialize(
            dir.to_path_buf(),
            ExecutorKind::Custom(cmd.into()),
            RunOptions {
                sweep_iterations,
                push: false,
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sweeper.sh");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn sweep_exhaustion_is_a_typed_failure() {
        let dir = tempfile::tempdir().unwrap();
        // `cat` never writes the marker.
        let ctx = ctx_with("cat", dir.path(), 2);

        let err = run_finalizer(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        let typed = as_orchestrator_error(&err).unwrap();
        assert!(matches!(
            typed,
            OrchestratorError::FinalReviewExhausted { iterations: 2 }
        ));
        assert!(!ctx.store.has_completion_marker());
    }

    #[tokio::test]
    async fn sweep_passes_when_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ctx_with("cat", dir.path(), 3);
        let marker = staging.store.run_file(CRITICAL_REVIEW_PASSED);
        let cmd = script(
            dir.path(),
            &format!("echo 'audited, no critical bugs' > {}", marker.display()),
        );
        let ctx = ctx_with(&cmd, dir.path(), 3);

        run_finalizer(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(ctx.store.has_critical_review_marker());
        assert!(ctx.store.has_completion_marker());
    }

    #[tokio::test]
    async fn existing_marker_skips_the_sweep_entirely() {
        let dir = tempfile::tempdir().unwrap();
        // `false` would fail if the sweep ran.
        let ctx = ctx_with("false", dir.path(), 3);
        std::fs::write(ctx.store.run_file(CRITICAL_REVIEW_PASSED), "passed\n").unwrap();

        run_finalizer(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(ctx.store.has_completion_marker());
    }

    #[tokio::test]
    async fn finalizer_is_idempotent_once_complete() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with("false", dir.path(), 1);
        std::fs::write(ctx.store.run_file(CRITICAL_REVIEW_PASSED), "passed\n").unwrap();
        run_finalizer(&ctx, &CancellationToken::new()).await.unwrap();

        // Second invocation returns immediately; the failing executor proves
        // nothing else runs.
        run_finalizer(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(ctx.store.has_completion_marker());
    }

    #[test]
    fn cumulative_diff_reports_non_git_roots() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with("cat", dir.path(), 1);
        let diff = cumulative_diff(&ctx);
        assert!(diff.contains("not a git repository"));
    }

    #[test]
    fn cumulative_diff_sees_workspace_changes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "t").unwrap();
        config.set_str("user.email", "t@t").unwrap();
        drop(config);
        std::fs::write(dir.path().join("seed.txt"), "seed\n").unwrap();
        GitOps::open(dir.path()).unwrap().commit("init").unwrap();

        let ctx = ctx_with("cat", dir.path(), 1);
        std::fs::write(dir.path().join("feature.rs"), "fn feature() {}\n").unwrap();
        let diff = cumulative_diff(&ctx);
        assert!(diff.contains("feature.rs"));
    }
}
