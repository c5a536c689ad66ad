//! Shared helpers: task-id parsing and small string utilities.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

fn task_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^TASK\d+(\.\d+)*$").unwrap())
}

/// Whether a directory name is a task id (`TASK<n>` or dotted `TASK<n>.<m>...`).
pub fn is_task_id(name: &str) -> bool {
    task_id_re().is_match(name)
}

/// Numeric components of a task id: `TASK2.10.1` -> `[2, 10, 1]`.
///
/// Non-task-id inputs yield an empty vector.
pub fn id_components(id: &str) -> Vec<u64> {
    if !is_task_id(id) {
        return Vec::new();
    }
    id.trim_start_matches("TASK")
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// The parent of a dotted subtask id: `TASK2.1` -> `TASK2`, `TASK2` -> None.
pub fn parent_id(id: &str) -> Option<String> {
    let idx = id.rfind('.')?;
    let parent = &id[..idx];
    is_task_id(parent).then(|| parent.to_string())
}

/// Whether `id` is a subtask (at any depth) of `ancestor`.
pub fn is_subtask_of(id: &str, ancestor: &str) -> bool {
    id.len() > ancestor.len()
        && id.starts_with(ancestor)
        && id.as_bytes()[ancestor.len()] == b'.'
}

/// Order ids by numeric components, so `TASK2` < `TASK10` and
/// `TASK2` < `TASK2.1` < `TASK2.2`.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    id_components(a).cmp(&id_components(b))
}

/// Filesystem-safe UTC timestamp for backup file names.
pub fn timestamp_slug() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

/// Largest byte index not past `max` that lies on a char boundary.
///
/// `String::truncate` panics mid-codepoint; size caps over arbitrary UTF-8
/// (diffs, executor-authored text) must clamp through this first.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Truncate a string with ellipsis, on a char boundary.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// First line of a block of text, truncated for log display.
pub fn first_line_snippet(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    truncate(first_line.trim(), max_len)
}
