//! The task DAG: graph construction and parallel wave execution.

pub mod builder;
pub mod executor;

pub use self::builder::{GraphOutcome, NodeStatus, TaskGraph, TaskNode, build_graph};
pub use self::executor::{DagExecutor, RunSummary, TaskWorker};
