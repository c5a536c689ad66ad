//! Decoding of the executor's line-delimited JSON output stream.
//!
//! The stream is a stable contract of the underlying tool. The orchestrator
//! only extracts human-readable message text (and short tool-use summaries)
//! for logs and the per-task display; structural frames are discarded and
//! nothing deeper is interpreted.

use serde::Deserialize;
use serde_json::Value;

use crate::util::first_line_snippet;

/// Raw events as emitted by the executor CLI.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

/// What the supervisor actually consumes per stream line.
#[derive(Debug, PartialEq)]
pub enum ExecutorEvent {
    /// Assistant prose, accumulated into the invocation output.
    Message(String),
    /// One-line summary of a tool invocation, for the task log.
    Activity(String),
    /// The terminal result frame.
    Result { text: Option<String>, is_error: bool },
    /// A line that was not part of the JSON protocol (stderr bleed etc.).
    Raw(String),
}

/// Digest one stream line into the events the supervisor cares about.
pub fn digest_line(line: &str) -> Vec<ExecutorEvent> {
    let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
        return vec![ExecutorEvent::Raw(line.to_string())];
    };
    match event {
        StreamEvent::Assistant { message } => message
            .content
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text { text } => ExecutorEvent::Message(text),
                ContentBlock::ToolUse { name, input } => {
                    ExecutorEvent::Activity(describe_tool_use(&name, &input))
                }
            })
            .collect(),
        StreamEvent::Result { result, is_error } => vec![ExecutorEvent::Result {
            text: result,
            is_error,
        }],
        // Structural frames carry nothing the orchestrator interprets.
        StreamEvent::User {} | StreamEvent::System { .. } => Vec::new(),
    }
}

/// Short human-readable summary of a tool-use frame.
fn describe_tool_use(name: &str, input: &Value) -> String {
    let path_of = |key: &str| {
        input
            .get(key)
            .and_then(Value::as_str)
            .map(tail_path)
            .unwrap_or_else(|| "?".to_string())
    };
    match name {
        "Read" => format!("read {}", path_of("file_path")),
        "Write" => format!("write {}", path_of("file_path")),
        "Edit" => format!("edit {}", path_of("file_path")),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(Value::as_str)
                .map(|c| first_line_snippet(c, 48))
                .unwrap_or_else(|| "?".to_string());
            format!("run `{cmd}`")
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(Value::as_str)
                .map(|p| first_line_snippet(p, 32))
                .unwrap_or_else(|| "?".to_string());
            format!("search {pattern}")
        }
        other => other.to_string(),
    }
}

/// Last two path components, enough to identify a file in a log line.
fn tail_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() <= 2 {
        path.trim_start_matches('/').to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}
