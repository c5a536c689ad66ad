//! Stages 2 and 3: decompose the specification into task folders and make
//! sure every task declares its dependencies.
//!
//! Dependency assignment has a deterministic fallback: if the analyzer run
//! leaves tasks undeclared, they are chained sequentially so the DAG can
//! always be built.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::dag::builder::{GraphOutcome, build_graph};
use crate::executor::{ExecOptions, ModelTier};
use crate::store::{AI_PROMPT, TASK_FILE};
use crate::{prompts, template};

/// Stage 2: produce task folders from the run specification. Returns the
/// number of tasks on disk afterwards.
pub async fn run_decompose(ctx: &RunContext, cancel: &CancellationToken) -> Result<usize> {
    let store = &ctx.store;
    let spec_path = store.run_file(AI_PROMPT);
    let spec = std::fs::read_to_string(&spec_path)
        .with_context(|| format!("Failed to read {}", spec_path.display()))?;

    let template = template::load(&store.prompts_dir(), "decompose", prompts::DECOMPOSE);
    let prompt = template::render(
        &template,
        &[
            ("spec", spec.as_str()),
            ("coord_dir", &store.coord_dir().display().to_string()),
        ],
    )?;

    ctx.logger.info("decomposing specification into tasks");
    ctx.supervisor
        .execute(
            &prompt,
            None,
            cancel,
            ExecOptions {
                model: Some(ModelTier::Medium),
                ..Default::default()
            },
        )
        .await?;

    let tasks = store.list_tasks()?;
    if tasks.is_empty() {
        bail!("decomposition produced no task folders");
    }
    ctx.logger
        .info(&format!("decomposed into {} tasks: {}", tasks.len(), tasks.join(", ")));
    Ok(tasks.len())
}

/// Stage 3: ensure every TASK.md starts with a `@dependencies` declaration.
///
/// Runs the analyzer once over the undeclared tasks; whatever it leaves
/// undeclared gets sequential dependencies written directly.
pub async fn ensure_dependencies(ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
    let missing = match build_graph(&ctx.store)? {
        GraphOutcome::Ready(_) => return Ok(()),
        GraphOutcome::Incomplete { missing } => missing,
    };

    ctx.logger.info(&format!(
        "assigning dependencies ({} tasks undeclared)",
        missing.len()
    ));

    let task_list = describe_tasks(ctx, &missing)?;
    let store = &ctx.store;
    let template = template::load(&store.prompts_dir(), "assign_deps", prompts::ASSIGN_DEPS);
    let prompt = template::render(
        &template,
        &[
            ("task_list", task_list.as_str()),
            ("coord_dir", &store.coord_dir().display().to_string()),
        ],
    )?;

    let analyzer = ctx
        .supervisor
        .execute(
            &prompt,
            None,
            cancel,
            ExecOptions {
                model: Some(ModelTier::Medium),
                ..Default::default()
            },
        )
        .await;
    if let Err(err) = analyzer {
        if let Some(typed) = crate::errors::as_orchestrator_error(&err) {
            if typed.is_cancelled() {
                return Err(err);
            }
        }
        ctx.logger
            .warn(&format!("dependency analyzer failed ({err}); falling back to sequential"));
    }

    if let GraphOutcome::Incomplete { missing } = build_graph(&ctx.store)? {
        assign_sequential(ctx, &missing)?;
    }

    // The graph must be buildable now; surface anything still wrong.
    match build_graph(&ctx.store)? {
        GraphOutcome::Ready(_) => Ok(()),
        GraphOutcome::Incomplete { missing } => Err(
            crate::errors::OrchestratorError::DependenciesIncomplete { tasks: missing }.into(),
        ),
    }
}

/// One summary block per task for the analyzer prompt, flagging which ones
/// lack a declaration.
fn describe_tasks(ctx: &RunContext, missing: &[String]) -> Result<String> {
    let mut out = String::new();
    for id in ctx.store.list_tasks()? {
        let body = ctx.store.read_task_file(&id)?;
        let title = body
            .lines()
            .find(|l| l.trim_start().starts_with('#'))
            .unwrap_or("")
            .trim()
            .to_string();
        let state = if missing.contains(&id) {
            "MISSING @dependencies"
        } else {
            "declared"
        };
        out.push_str(&format!("- {id} ({state}): {title}\n"));
    }
    Ok(out)
}

/// Fallback: chain undeclared tasks behind their predecessor in id order.
fn assign_sequential(ctx: &RunContext, missing: &[String]) -> Result<()> {
    let all = ctx.store.list_tasks()?;
    for id in missing {
        let position = all.iter().position(|t| t == id).unwrap_or(0);
        let deps_line = match position {
            0 => "@dependencies none".to_string(),
            i => format!("@dependencies [{}]", all[i - 1]),
        };
        let body = ctx.store.read_task_file(id)?;
        ctx.store
            .write_task_doc(id, TASK_FILE, &format!("{deps_line}\n{body}"))?;
        ctx.logger
            .task(id, &format!("sequential dependency fallback: {deps_line}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RunContext, RunOptions};
    use crate::dag::builder::declared_deps;
    use crate::executor::ExecutorKind;
    use std::sync::Arc;

    fn ctx() -> (Arc<RunContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::initialize(
            dir.path().to_path_buf(),
            ExecutorKind::Custom("cat".into()),
            RunOptions::default(),
            None,
        )
        .unwrap();
        (ctx, dir)
    }

    #[tokio::test]
    async fn decompose_fails_when_no_folders_appear() {
        let (ctx, _dir) = ctx();
        std::fs::write(ctx.store.run_file(AI_PROMPT), "# Spec").unwrap();
        // The `cat` executor creates nothing.
        let err = run_decompose(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no task folders"));
    }

    #[tokio::test]
    async fn decompose_counts_existing_folders() {
        let (ctx, _dir) = ctx();
        std::fs::write(ctx.store.run_file(AI_PROMPT), "# Spec").unwrap();
        ctx.store
            .write_task_doc("TASK1", TASK_FILE, "@dependencies none\n# a\n")
            .unwrap();
        ctx.store
            .write_task_doc("TASK2", TASK_FILE, "@dependencies [TASK1]\n# b\n")
            .unwrap();
        let count = run_decompose(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn ensure_dependencies_noop_when_all_declared() {
        let (ctx, _dir) = ctx();
        ctx.store
            .write_task_doc("TASK1", TASK_FILE, "@dependencies none\n# a\n")
            .unwrap();
        ensure_dependencies(&ctx, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sequential_fallback_chains_tasks_in_order() {
        let (ctx, _dir) = ctx();
        // The analyzer (`cat`) will not fix anything, so the fallback must.
        ctx.store
            .write_task_doc("TASK1", TASK_FILE, "# first\n")
            .unwrap();
        ctx.store
            .write_task_doc("TASK2", TASK_FILE, "# second\n")
            .unwrap();
        ctx.store
            .write_task_doc("TASK3", TASK_FILE, "@dependencies [TASK1]\n# third\n")
            .unwrap();

        ensure_dependencies(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        let t1 = ctx.store.read_task_file("TASK1").unwrap();
        let t2 = ctx.store.read_task_file("TASK2").unwrap();
        let t3 = ctx.store.read_task_file("TASK3").unwrap();
        assert!(declared_deps(&t1).unwrap().is_empty());
        assert_eq!(declared_deps(&t2).unwrap(), vec!["TASK1"]);
        assert_eq!(declared_deps(&t3).unwrap(), vec!["TASK1"]);
        // Original bodies survive below the prepended line.
        assert!(t1.contains("# first"));
        assert!(t2.contains("# second"));
    }
}
