//! Stages 0 and 1: bootstrap the run specification and fold in
//! clarification answers.
//!
//! Bootstrap may pause the run: when the executor leaves open questions, a
//! pending marker is written and the orchestrator exits cleanly until the
//! operator answers and re-invokes with `--continue`.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::executor::{ExecOptions, ModelTier};
use crate::store::{
    AI_PROMPT, CLARIFICATION_ANSWERS, CLARIFICATION_QUESTIONS, INITIAL_PROMPT,
};
use crate::{prompts, template};

/// Result of the bootstrap stage.
#[derive(Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The run specification exists; the pipeline may proceed.
    Ready,
    /// Clarification questions are pending operator answers.
    Paused,
}

/// Stage 0: produce the run specification from the operator's request.
pub async fn run_bootstrap(ctx: &RunContext, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
    let store = &ctx.store;
    let initial_path = store.run_file(INITIAL_PROMPT);

    let initial_prompt = match &ctx.options.prompt {
        Some(text) => {
            std::fs::write(&initial_path, text)
                .with_context(|| format!("Failed to write {}", initial_path.display()))?;
            text.clone()
        }
        None => std::fs::read_to_string(&initial_path).map_err(|_| {
            anyhow::anyhow!("No prompt given and no {INITIAL_PROMPT} from a prior run; pass --prompt")
        })?,
    };

    let template = template::load(&store.prompts_dir(), "bootstrap", prompts::BOOTSTRAP);
    let prompt = template::render(
        &template,
        &[
            ("initial_prompt", initial_prompt.as_str()),
            ("coord_dir", &store.coord_dir().display().to_string()),
        ],
    )?;

    ctx.logger.info("bootstrapping run specification");
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

    if has_open_questions(ctx) {
        store.set_pending_clarification()?;
        ctx.logger.info(
            "clarification questions are pending; answer CLARIFICATION_ANSWERS.json and re-run with --continue",
        );
        return Ok(BootstrapOutcome::Paused);
    }

    if !store.run_file(AI_PROMPT).exists() {
        bail!("bootstrap did not produce {AI_PROMPT}");
    }
    Ok(BootstrapOutcome::Ready)
}

/// Stage 1: incorporate operator answers into the final specification.
pub async fn run_clarify(ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
    let store = &ctx.store;
    let answers_path = store.run_file(CLARIFICATION_ANSWERS);
    if !answers_path.exists() {
        bail!(
            "--continue requires answers at {}; write them and re-run",
            answers_path.display()
        );
    }

    let initial_prompt =
        std::fs::read_to_string(store.run_file(INITIAL_PROMPT)).unwrap_or_default();
    let questions =
        std::fs::read_to_string(store.run_file(CLARIFICATION_QUESTIONS)).unwrap_or_default();
    let answers = std::fs::read_to_string(&answers_path)
        .with_context(|| format!("Failed to read {}", answers_path.display()))?;

    let template = template::load(&store.prompts_dir(), "clarify", prompts::CLARIFY);
    let prompt = template::render(
        &template,
        &[
            ("initial_prompt", initial_prompt.as_str()),
            ("questions", questions.as_str()),
            ("answers", answers.as_str()),
            ("coord_dir", &store.coord_dir().display().to_string()),
        ],
    )?;

    ctx.logger.info("incorporating clarification answers");
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

    if !store.run_file(AI_PROMPT).exists() {
        bail!("clarification did not produce {AI_PROMPT}");
    }
    store.clear_pending_clarification()?;
    Ok(())
}

/// Questions exist, are a non-empty JSON array, and have no answers yet.
fn has_open_questions(ctx: &RunContext) -> bool {
    let store = &ctx.store;
    if store.run_file(CLARIFICATION_ANSWERS).exists() {
        return false;
    }
    let Ok(content) = std::fs::read_to_string(store.run_file(CLARIFICATION_QUESTIONS)) else {
        return false;
    };
    matches!(
        serde_json::from_str::<serde_json::Value>(&content),
        Ok(serde_json::Value::Array(items)) if !items.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RunContext, RunOptions};
    use crate::executor::ExecutorKind;
    use std::sync::Arc;

    fn ctx_with_prompt(prompt: Option<&str>) -> (Arc<RunContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::initialize(
            dir.path().to_path_buf(),
            ExecutorKind::Custom("cat".into()),
            RunOptions {
                prompt: prompt.map(str::to_string),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        (ctx, dir)
    }

    #[tokio::test]
    async fn bootstrap_without_prompt_or_prior_run_fails() {
        let (ctx, _dir) = ctx_with_prompt(None);
        let err = run_bootstrap(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--prompt"));
    }

    #[tokio::test]
    async fn bootstrap_pauses_on_open_questions() {
        let (ctx, _dir) = ctx_with_prompt(Some("add dark mode"));
        // Simulate the executor having produced questions on a prior partial
        // run; the `cat` executor produces nothing itself.
        std::fs::write(
            ctx.store.run_file(CLARIFICATION_QUESTIONS),
            r#"[{"id": "q1", "question": "which theme system?"}]"#,
        )
        .unwrap();

        let outcome = run_bootstrap(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Paused);
        assert!(ctx.store.has_pending_clarification());
        // The request is persisted for the resumed run.
        let initial = std::fs::read_to_string(ctx.store.run_file(INITIAL_PROMPT)).unwrap();
        assert_eq!(initial, "add dark mode");
    }

    #[tokio::test]
    async fn bootstrap_ready_when_spec_exists_and_no_questions() {
        let (ctx, _dir) = ctx_with_prompt(Some("add dark mode"));
        std::fs::write(ctx.store.run_file(AI_PROMPT), "# Spec").unwrap();
        let outcome = run_bootstrap(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Ready);
        assert!(!ctx.store.has_pending_clarification());
    }

    #[tokio::test]
    async fn answered_questions_do_not_pause() {
        let (ctx, _dir) = ctx_with_prompt(Some("add dark mode"));
        std::fs::write(ctx.store.run_file(AI_PROMPT), "# Spec").unwrap();
        std::fs::write(
            ctx.store.run_file(CLARIFICATION_QUESTIONS),
            r#"[{"id": "q1", "question": "?"}]"#,
        )
        .unwrap();
        std::fs::write(ctx.store.run_file(CLARIFICATION_ANSWERS), r#"{"q1": "yes"}"#).unwrap();

        let outcome = run_bootstrap(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Ready);
    }

    #[tokio::test]
    async fn clarify_requires_answers_file() {
        let (ctx, _dir) = ctx_with_prompt(None);
        let err = run_clarify(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CLARIFICATION_ANSWERS"));
    }

    #[tokio::test]
    async fn clarify_clears_pending_flag() {
        let (ctx, _dir) = ctx_with_prompt(None);
        ctx.store.set_pending_clarification().unwrap();
        std::fs::write(ctx.store.run_file(CLARIFICATION_ANSWERS), "{}").unwrap();
        std::fs::write(ctx.store.run_file(AI_PROMPT), "# Spec").unwrap();

        run_clarify(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(!ctx.store.has_pending_clarification());
    }
}
