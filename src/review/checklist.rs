//! Review-checklist completion.
//!
//! The checklist (when a prior stage produced one) enumerates concrete
//! changes to verify. Completion runs the fast model: the work is bounded
//! and structural. A missing or empty checklist is a no-op; a failure to
//! reload afterwards is reported but never aborts the wider review.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::errors::as_orchestrator_error;
use crate::executor::{ExecOptions, ModelTier};
use crate::store::REVIEW_CHECKLIST;
use crate::{prompts, template};

/// One item to verify during review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChecklistItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file: String,
    /// Line range hint; shape is executor-defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Value>,
    /// modified | created
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub reviewed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of checklist completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecklistOutcome {
    pub success: bool,
    pub completed: usize,
    pub total: usize,
}

impl ChecklistOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            completed: 0,
            total: 0,
        }
    }
}

/// Complete the checklist for one task.
///
/// Only cancellation propagates as an error; every other failure mode is
/// folded into the outcome so the review proper can proceed.
pub async fn complete_checklist(
    ctx: &RunContext,
    id: &str,
    cancel: &CancellationToken,
) -> Result<ChecklistOutcome> {
    let store = &ctx.store;
    let path = store.task_path(id, REVIEW_CHECKLIST);
    if !path.exists() {
        return Ok(ChecklistOutcome::skipped());
    }

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            ctx.logger
                .task(id, &format!("checklist unreadable ({err}); skipping"));
            return Ok(ChecklistOutcome {
                success: false,
                completed: 0,
                total: 0,
            });
        }
    };
    let items: Vec<ChecklistItem> = match serde_json::from_str(&raw) {
        Ok(items) => items,
        Err(err) => {
            ctx.logger
                .task(id, &format!("checklist unparseable ({err}); skipping"));
            return Ok(ChecklistOutcome {
                success: false,
                completed: 0,
                total: 0,
            });
        }
    };
    if items.is_empty() {
        return Ok(ChecklistOutcome::skipped());
    }
    let total = items.len();

    let template = template::load(&store.prompts_dir(), "checklist", prompts::CHECKLIST);
    let prompt = template::render(
        &template,
        &[
            ("task_id", id),
            ("checklist_path", &path.display().to_string()),
            ("items", &group_by_file(&items)),
            ("raw_json", raw.as_str()),
        ],
    )?;

    let run = ctx
        .supervisor
        .execute(
            &prompt,
            Some(id),
            cancel,
            ExecOptions {
                model: Some(ModelTier::Fast),
                ..Default::default()
            },
        )
        .await;
    if let Err(err) = run {
        if let Some(typed) = as_orchestrator_error(&err) {
            if typed.is_cancelled() {
                return Err(err);
            }
        }
        ctx.logger
            .task(id, &format!("checklist completion failed: {err}"));
        return Ok(ChecklistOutcome {
            success: false,
            completed: 0,
            total,
        });
    }

    // Reload to count what actually got verified.
    let reloaded: Result<Vec<ChecklistItem>, _> = std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from));
    match reloaded {
        Ok(items) => {
            let completed = items.iter().filter(|i| i.reviewed).count();
            Ok(ChecklistOutcome {
                success: true,
                completed,
                total: items.len(),
            })
        }
        Err(err) => {
            ctx.logger
                .task(id, &format!("checklist reload failed: {err}"));
            Ok(ChecklistOutcome {
                success: false,
                completed: 0,
                total,
            })
        }
    }
}

/// Items rendered grouped by file, the way a reviewer works through them.
fn group_by_file(items: &[ChecklistItem]) -> String {
    let mut groups: BTreeMap<&str, Vec<&ChecklistItem>> = BTreeMap::new();
    for item in items {
        groups.entry(item.file.as_str()).or_default().push(item);
    }
    let mut out = String::new();
    for (file, items) in groups {
        out.push_str(&format!("### {file}\n"));
        for item in items {
            let lines = item
                .lines
                .as_ref()
                .map(|l| format!(" (lines {l})"))
                .unwrap_or_default();
            out.push_str(&format!(
                "- [{}] {} {}: {}{}\n",
                item.id, item.kind, item.category, item.description, lines
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RunContext, RunOptions};
    use crate::executor::ExecutorKind;
    use std::sync::Arc;

    fn ctx_with(cmd: &str) -> (Arc<RunContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::initialize(
            dir.path().to_path_buf(),
            ExecutorKind::Custom(cmd.into()),
            RunOptions::default(),
            None,
        )
        .unwrap();
        (ctx, dir)
    }

    fn item(id: &str, file: &str, reviewed: bool) -> ChecklistItem {
        ChecklistItem {
            id: id.into(),
            file: file.into(),
            kind: "modified".into(),
            description: format!("change {id}"),
            category: "logic".into(),
            reviewed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_checklist_is_a_noop() {
        let (ctx, _dir) = ctx_with("false"); // would fail if invoked
        std::fs::create_dir_all(ctx.store.task_dir("TASK1")).unwrap();
        let outcome = complete_checklist(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChecklistOutcome {
                success: true,
                completed: 0,
                total: 0
            }
        );
    }

    #[tokio::test]
    async fn empty_checklist_skips_execution() {
        let (ctx, _dir) = ctx_with("false");
        ctx.store
            .write_task_doc("TASK1", REVIEW_CHECKLIST, "[]")
            .unwrap();
        let outcome = complete_checklist(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.total, 0);
    }

    #[tokio::test]
    async fn malformed_checklist_reports_failure_without_running() {
        let (ctx, _dir) = ctx_with("false");
        ctx.store
            .write_task_doc("TASK1", REVIEW_CHECKLIST, "{not an array")
            .unwrap();
        let outcome = complete_checklist(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.total, 0);
    }

    #[tokio::test]
    async fn reviewed_items_are_counted_after_the_run() {
        // `cat` leaves the file as-is, so pre-marked items are the count.
        let (ctx, _dir) = ctx_with("cat");
        let items = vec![
            item("c1", "src/a.rs", true),
            item("c2", "src/a.rs", false),
            item("c3", "src/b.rs", true),
        ];
        ctx.store
            .write_task_doc(
                "TASK1",
                REVIEW_CHECKLIST,
                &serde_json::to_string(&items).unwrap(),
            )
            .unwrap();

        let outcome = complete_checklist(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.total, 3);
    }

    #[tokio::test]
    async fn executor_failure_keeps_review_alive() {
        let (ctx, _dir) = ctx_with("false");
        let items = vec![item("c1", "src/a.rs", false)];
        ctx.store
            .write_task_doc(
                "TASK1",
                REVIEW_CHECKLIST,
                &serde_json::to_string(&items).unwrap(),
            )
            .unwrap();

        let outcome = complete_checklist(&ctx, "TASK1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.total, 1);
    }

    #[test]
    fn grouping_renders_per_file_sections() {
        let items = vec![
            item("c1", "src/b.rs", false),
            item("c2", "src/a.rs", false),
            item("c3", "src/b.rs", false),
        ];
        let text = group_by_file(&items);
        let a_pos = text.find("### src/a.rs").unwrap();
        let b_pos = text.find("### src/b.rs").unwrap();
        assert!(a_pos < b_pos);
        assert_eq!(text.matches("- [c").count(), 3);
    }

    #[test]
    fn checklist_item_round_trips_unknown_fields() {
        let json = r#"{"id":"c1","file":"src/a.rs","type":"created","description":"d","category":"x","reviewed":false,"vendorNote":"keep"}"#;
        let item: ChecklistItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.kind, "created");
        let out = serde_json::to_string(&item).unwrap();
        assert!(out.contains("vendorNote"));
    }
}
