//! Parallel DAG execution.
//!
//! A single coordinator loop owns the graph and the in-flight set; workers
//! run on tokio tasks and report through an mpsc channel. Ready tasks are
//! dispatched in ascending id order up to the concurrency cap, the graph is
//! rebuilt from disk between waves (splits add nodes mid-run), and worker
//! errors become task outcomes here rather than unwinding siblings.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::dag::builder::{GraphOutcome, TaskGraph, build_graph};
use crate::errors::OrchestratorError;
use crate::pipeline::{self, TaskOutcome};
use crate::ui::DagProgress;
use crate::util;

/// One scheduled unit of work: runs the appropriate stage for a task and
/// reports the outcome. Injected so scheduler behavior is testable without
/// spawning executors.
pub type TaskWorker =
    Arc<dyn Fn(String, CancellationToken) -> BoxFuture<'static, TaskOutcome> + Send + Sync>;

/// Final report of a scheduler run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Every task is approved.
    pub success: bool,
    pub approved: Vec<String>,
    /// Tasks that hit the attempt budget (terminally blocked).
    pub exhausted: Vec<String>,
    /// Tasks with unrecoverable state errors.
    pub fatal: Vec<String>,
    /// Tasks whose current stage is excluded by `--steps`.
    pub skipped: Vec<String>,
    /// Pending tasks that could no longer be scheduled (blocked dependents).
    pub unreachable: Vec<String>,
    pub cancelled: bool,
    /// Dispatch rounds that started at least one task.
    pub waves: u64,
}

impl RunSummary {
    /// Operator-facing report of what stopped the run.
    pub fn report(&self) -> String {
        if self.success {
            return format!(
                "all {} tasks approved in {} waves",
                self.approved.len(),
                self.waves
            );
        }
        let mut lines = Vec::new();
        if self.cancelled {
            lines.push("run cancelled by operator".to_string());
        }
        if !self.exhausted.is_empty() {
            lines.push(format!(
                "attempt budget exhausted: {}",
                self.exhausted.join(", ")
            ));
        }
        if !self.fatal.is_empty() {
            lines.push(format!("unrecoverable state: {}", self.fatal.join(", ")));
        }
        if !self.skipped.is_empty() {
            lines.push(format!(
                "stages excluded by --steps: {}",
                self.skipped.join(", ")
            ));
        }
        if !self.unreachable.is_empty() {
            lines.push(format!("never became ready: {}", self.unreachable.join(", ")));
        }
        if lines.is_empty() {
            lines.push("run stopped before all tasks were approved".to_string());
        }
        lines.join("; ")
    }
}

/// The wave scheduler.
pub struct DagExecutor {
    ctx: Arc<RunContext>,
    cancel: CancellationToken,
}

impl DagExecutor {
    pub fn new(ctx: Arc<RunContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Drive the graph with the real per-task stage pipeline.
    pub async fn run(&self) -> Result<RunSummary> {
        let ctx = self.ctx.clone();
        let worker: TaskWorker = Arc::new(move |id, cancel| {
            let ctx = ctx.clone();
            Box::pin(async move { pipeline::run_next_stage(&ctx, &id, &cancel).await })
        });
        self.run_with(worker).await
    }

    /// Drive the graph with an injected worker.
    pub async fn run_with(&self, worker: TaskWorker) -> Result<RunSummary> {
        let logger = &self.ctx.logger;
        let max_concurrent = self.ctx.options.max_concurrent.max(1);
        let (tx, mut rx) = mpsc::channel::<(String, TaskOutcome)>(64);

        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut exhausted: BTreeSet<String> = BTreeSet::new();
        let mut fatal: BTreeSet<String> = BTreeSet::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();
        // Failures that never reached the execution record (e.g. planning
        // crashes) still count against the budget, or a task could spin
        // forever without ever incrementing `attempts`.
        let mut dispatch_failures: HashMap<String, u32> = HashMap::new();
        let mut waves = 0u64;
        let mut cancelled = false;

        let mut progress: Option<DagProgress> = None;

        loop {
            // Tasks may split at any time; the graph on disk is authoritative.
            let graph = match build_graph(&self.ctx.store)? {
                GraphOutcome::Ready(graph) => graph,
                GraphOutcome::Incomplete { missing } => {
                    return Err(OrchestratorError::DependenciesIncomplete { tasks: missing }.into());
                }
            };

            let bar = progress.get_or_insert_with(|| {
                DagProgress::new(graph.len(), !self.ctx.options.verbose)
            });
            let mut running: Vec<String> = in_flight.keys().cloned().collect();
            running.sort_by(|a, b| util::compare_ids(a, b));
            let approved_count = graph
                .ids()
                .iter()
                .filter(|id| graph.is_completed(id))
                .count();
            bar.update(approved_count, graph.len(), &running);

            if graph.all_completed() && in_flight.is_empty() {
                bar.finish("all tasks approved");
                return Ok(finish(&graph, &exhausted, &fatal, &skipped, cancelled, waves));
            }

            if self.cancel.is_cancelled() {
                cancelled = true;
            }

            if !cancelled {
                let mut dispatched_this_round = false;
                for id in graph.ready_set() {
                    if in_flight.len() >= max_concurrent {
                        break;
                    }
                    if in_flight.contains_key(&id)
                        || exhausted.contains(&id)
                        || fatal.contains(&id)
                        || skipped.contains(&id)
                    {
                        continue;
                    }

                    if let Some(limit) = self.ctx.options.attempt_limit {
                        let recorded = self
                            .ctx
                            .store
                            .try_read_execution(&id)
                            .ok()
                            .flatten()
                            .map(|r| r.attempts)
                            .unwrap_or(0);
                        let effective =
                            recorded.max(dispatch_failures.get(&id).copied().unwrap_or(0));
                        if effective >= limit {
                            let err = OrchestratorError::AttemptsExhausted {
                                task: id.clone(),
                                attempts: effective,
                            };
                            logger.error(&err.to_string());
                            exhausted.insert(id);
                            continue;
                        }
                    }

                    let child = self.cancel.child_token();
                    let tx = tx.clone();
                    let worker = worker.clone();
                    let task_id = id.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = worker(task_id.clone(), child).await;
                        tx.send((task_id, outcome)).await.ok();
                    });
                    in_flight.insert(id, handle);
                    dispatched_this_round = true;
                }
                if dispatched_this_round {
                    waves += 1;
                }
            }

            if in_flight.is_empty() {
                // Nothing running and nothing dispatchable: either done (the
                // check above), cancelled, or the rest is unreachable.
                bar.finish("run stopped");
                return Ok(finish(&graph, &exhausted, &fatal, &skipped, cancelled, waves));
            }

            let received = if cancelled {
                rx.recv().await
            } else {
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = self.cancel.cancelled() => {
                        cancelled = true;
                        logger.info("cancellation received; waiting for in-flight tasks");
                        continue;
                    }
                }
            };
            let Some((id, outcome)) = received else { break };
            if let Some(handle) = in_flight.remove(&id) {
                handle.await.ok();
            }

            match outcome {
                TaskOutcome::Approved => logger.task(&id, "approved"),
                TaskOutcome::InProgress | TaskOutcome::StillBlocked => {}
                TaskOutcome::Split => {
                    logger.task(&id, "task split; rebuilding graph");
                }
                TaskOutcome::Skipped => {
                    skipped.insert(id);
                }
                TaskOutcome::Cancelled => {
                    cancelled = true;
                }
                TaskOutcome::Failed(message) => {
                    *dispatch_failures.entry(id.clone()).or_insert(0) += 1;
                    logger.warn(&format!("[{id}] stage failed: {message}"));
                }
                TaskOutcome::Fatal(message) => {
                    logger.error(&format!("[{id}] {message}"));
                    fatal.insert(id);
                }
            }
        }

        // The channel closed unexpectedly; report what we know.
        let graph = build_graph(&self.ctx.store)?
            .graph()
            .unwrap_or_default();
        Ok(finish(&graph, &exhausted, &fatal, &skipped, cancelled, waves))
    }
}

fn finish(
    graph: &TaskGraph,
    exhausted: &BTreeSet<String>,
    fatal: &BTreeSet<String>,
    skipped: &BTreeSet<String>,
    cancelled: bool,
    waves: u64,
) -> RunSummary {
    let approved: Vec<String> = graph
        .ids()
        .into_iter()
        .filter(|id| graph.is_completed(id))
        .collect();
    let terminal: BTreeSet<&String> = exhausted.iter().chain(fatal.iter()).chain(skipped.iter()).collect();
    let unreachable: Vec<String> = graph
        .ids()
        .into_iter()
        .filter(|id| !graph.is_completed(id) && !terminal.contains(id))
        .collect();
    RunSummary {
        success: graph.all_completed(),
        approved,
        exhausted: exhausted.iter().cloned().collect(),
        fatal: fatal.iter().cloned().collect(),
        skipped: skipped.iter().cloned().collect(),
        unreachable,
        cancelled,
        waves,
    }
}
