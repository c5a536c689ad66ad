//! The `execution.json` record: canonical per-task state.
//!
//! This file is a shared contract: the external executor reads and writes it
//! directly, and every stage validates it. Deserialization is permissive
//! (every field defaulted) and unknown keys are preserved verbatim through
//! `#[serde(flatten)]` maps so executor extensions survive round-trips.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Overall task status as reported in `execution.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// Status of a single phase within the implementation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// One sub-step of the implementation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A file created or modified during implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Artifact {
    /// file, test, doc, ...
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Append-only error log entry.
///
/// Timestamps stay strings on the wire: the executor writes this file too
/// and a malformed timestamp must not invalidate the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorEntry {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An assumption the executor made, with confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Uncertainty {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub assumption: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Uncertainty {
    /// Unresolved means no resolution text at all.
    pub fn is_unresolved(&self) -> bool {
        self.resolution
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    PendingValidation,
    Completed,
}

/// Completion block: the executor's own report of the final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    #[serde(default)]
    pub status: CompletionStatus,
    #[serde(default)]
    pub summary: Vec<String>,
    #[serde(default)]
    pub for_future_tasks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub code_review_passed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hygiene checklist the implementation stage must satisfy before review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Cleanup {
    #[serde(default)]
    pub debug_logs_removed: bool,
    #[serde(default)]
    pub formatting_consistent: bool,
    #[serde(default)]
    pub dead_code_removed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cleanup {
    pub fn all_done(&self) -> bool {
        self.debug_logs_removed && self.formatting_consistent && self.dead_code_removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BeyondTheBasics {
    #[serde(default)]
    pub cleanup: Cleanup,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The full execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub phases: Vec<PhaseEntry>,
    /// Reference to one entry in `phases`; the executor may write either the
    /// phase id as a string or an embedded object, so this stays untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error_history: Vec<ErrorEntry>,
    #[serde(default)]
    pub uncertainties: Vec<Uncertainty>,
    #[serde(default)]
    pub completion: Completion,
    #[serde(default)]
    pub beyond_the_basics: BeyondTheBasics,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionRecord {
    /// Fresh skeleton written at planning time.
    pub fn skeleton() -> Self {
        Self {
            status: TaskStatus::Pending,
            ..Default::default()
        }
    }

    /// The completion predicate, in preference order:
    /// 1. `completion.status == completed` (highest confidence), else
    /// 2. `status == completed`, else
    /// 3. phases non-empty and all completed.
    ///
    /// A `blocked` status is definitive regardless of the other fields.
    pub fn is_complete(&self) -> bool {
        if self.status == TaskStatus::Blocked {
            return false;
        }
        if self.completion.status == CompletionStatus::Completed {
            return true;
        }
        if self.status == TaskStatus::Completed {
            return true;
        }
        !self.phases.is_empty() && self.all_phases_completed()
    }

    pub fn is_blocked(&self) -> bool {
        self.status == TaskStatus::Blocked
    }

    pub fn all_phases_completed(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_completed())
    }

    /// Human-readable label for the current phase, whichever shape the
    /// executor wrote.
    pub fn current_phase_label(&self) -> Option<String> {
        match self.current_phase.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj
                .get("name")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Append an error entry stamped now.
    pub fn record_error(&mut self, phase: &str, message: &str) {
        self.error_history.push(ErrorEntry {
            timestamp: Utc::now().to_rfc3339(),
            phase: phase.to_string(),
            message: message.to_string(),
            extra: Map::new(),
        });
    }

    /// The last `n` error entries, oldest first.
    pub fn last_errors(&self, n: usize) -> &[ErrorEntry] {
        let start = self.error_history.len().saturating_sub(n);
        &self.error_history[start..]
    }

    pub fn unresolved_uncertainties(&self) -> Vec<&Uncertainty> {
        self.uncertainties
            .iter()
            .filter(|u| u.is_unresolved())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_phases(n: usize) -> Vec<PhaseEntry> {
        (1..=n)
            .map(|i| PhaseEntry {
                id: format!("phase-{i}"),
                name: format!("Phase {i}"),
                status: PhaseStatus::Completed,
                extra: Map::new(),
            })
            .collect()
    }

    #[test]
    fn default_record_is_pending_and_incomplete() {
        let record = ExecutionRecord::default();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(!record.is_complete());
    }

    #[test]
    fn completion_status_wins_over_everything_else() {
        let record = ExecutionRecord {
            completion: Completion {
                status: CompletionStatus::Completed,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(record.is_complete());
    }

    #[test]
    fn top_level_status_is_second_preference() {
        let record = ExecutionRecord {
            status: TaskStatus::Completed,
            ..Default::default()
        };
        assert!(record.is_complete());
    }

    #[test]
    fn all_phases_completed_is_third_preference() {
        let record = ExecutionRecord {
            status: TaskStatus::InProgress,
            phases: completed_phases(3),
            ..Default::default()
        };
        assert!(record.is_complete());
    }

    #[test]
    fn empty_phases_alone_do_not_complete() {
        let record = ExecutionRecord {
            status: TaskStatus::InProgress,
            ..Default::default()
        };
        assert!(!record.is_complete());
    }

    #[test]
    fn blocked_overrides_completion_fields() {
        let record = ExecutionRecord {
            status: TaskStatus::Blocked,
            phases: completed_phases(2),
            completion: Completion {
                status: CompletionStatus::Completed,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!record.is_complete());
        assert!(record.is_blocked());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let mut record = ExecutionRecord::skeleton();
        record.record_error("phase-1", "boom");
        record.completion.code_review_passed = true;
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"errorHistory\""));
        assert!(json.contains("\"codeReviewPassed\":true"));
        assert!(json.contains("\"beyondTheBasics\""));
        assert!(json.contains("\"forFutureTasks\""));
        assert!(json.contains("\"pending_validation\""));
    }

    #[test]
    fn unknown_keys_round_trip() {
        let json = r#"{
            "status": "in_progress",
            "attempts": 2,
            "executorVersion": "9.9",
            "phases": [{"id": "p1", "name": "scaffold", "status": "completed", "note": "kept"}],
            "completion": {"status": "pending_validation", "vendorFlag": true}
        }"#;
        let record: ExecutionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra["executorVersion"], "9.9");
        assert_eq!(record.phases[0].extra["note"], "kept");
        assert_eq!(record.completion.extra["vendorFlag"], true);

        let out = serde_json::to_string(&record).unwrap();
        assert!(out.contains("executorVersion"));
        assert!(out.contains("vendorFlag"));
        assert!(out.contains("\"note\":\"kept\""));
    }

    #[test]
    fn structural_round_trip_is_equal() {
        let mut record = ExecutionRecord::skeleton();
        record.status = TaskStatus::InProgress;
        record.attempts = 4;
        record.phases = completed_phases(2);
        record.phases[1].status = PhaseStatus::Failed;
        record.artifacts.push(Artifact {
            kind: "file".into(),
            path: "src/api.rs".into(),
            extra: Map::new(),
        });
        record.record_error("phase-2", "test failure");
        record.uncertainties.push(Uncertainty {
            id: "u1".into(),
            topic: "auth".into(),
            assumption: "JWT in header".into(),
            confidence: 0.8,
            resolution: None,
            extra: Map::new(),
        });

        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn current_phase_accepts_string_or_object() {
        let record = ExecutionRecord {
            current_phase: Some(Value::String("phase-2".into())),
            ..Default::default()
        };
        assert_eq!(record.current_phase_label().as_deref(), Some("phase-2"));

        let record = ExecutionRecord {
            current_phase: Some(serde_json::json!({"id": "p3", "name": "wire up"})),
            ..Default::default()
        };
        assert_eq!(record.current_phase_label().as_deref(), Some("wire up"));
    }

    #[test]
    fn unresolved_uncertainties_ignores_resolved_and_blank() {
        let record = ExecutionRecord {
            uncertainties: vec![
                Uncertainty {
                    id: "u1".into(),
                    resolution: None,
                    ..Default::default()
                },
                Uncertainty {
                    id: "u2".into(),
                    resolution: Some("  ".into()),
                    ..Default::default()
                },
                Uncertainty {
                    id: "u3".into(),
                    resolution: Some("confirmed with schema".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let open: Vec<&str> = record
            .unresolved_uncertainties()
            .iter()
            .map(|u| u.id.as_str())
            .collect();
        assert_eq!(open, vec!["u1", "u2"]);
    }

    #[test]
    fn last_errors_returns_tail() {
        let mut record = ExecutionRecord::default();
        for i in 0..5 {
            record.record_error("p", &format!("e{i}"));
        }
        let tail = record.last_errors(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "e2");
        assert_eq!(tail[2].message, "e4");
    }

    #[test]
    fn cleanup_all_done_requires_every_flag() {
        let mut cleanup = Cleanup {
            debug_logs_removed: true,
            formatting_consistent: true,
            dead_code_removed: false,
            extra: Map::new(),
        };
        assert!(!cleanup.all_done());
        cleanup.dead_code_removed = true;
        assert!(cleanup.all_done());
    }
}
