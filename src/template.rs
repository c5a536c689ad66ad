//! Minimal `{{placeholder}}` prompt templating.
//!
//! Placeholders are enumerated per template and validated at render time:
//! rendering fails if the template references a name the caller did not
//! provide. Templates ship compiled in and can be overridden per name from
//! the coordination directory's `prompts/` folder.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").unwrap())
}

/// The set of placeholder names a template references.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every `{{name}}` with its value.
///
/// Unknown placeholders are an error (a template typo must not silently ship
/// a literal `{{name}}` to the executor). Unused values are allowed.
pub fn render(template: &str, values: &[(&str, &str)]) -> Result<String> {
    let referenced = placeholders(template);
    let provided: BTreeSet<&str> = values.iter().map(|(k, _)| *k).collect();
    let missing: Vec<&String> = referenced
        .iter()
        .filter(|name| !provided.contains(name.as_str()))
        .collect();
    if !missing.is_empty() {
        bail!(
            "Template references unknown placeholders: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    Ok(out)
}

/// Load a template by name, preferring an operator override under
/// `<prompts_dir>/<name>.md` and falling back to the compiled-in default.
pub fn load(prompts_dir: &Path, name: &str, default: &'static str) -> String {
    let override_path = prompts_dir.join(format!("{name}.md"));
    match std::fs::read_to_string(&override_path) {
        Ok(content) if !content.trim().is_empty() => content,
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn placeholders_are_enumerated() {
        let set = placeholders("a {{one}} b {{two}} c {{one}}");
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn render_substitutes_all_occurrences() {
        let out = render("{{id}}: {{id}} is {{state}}", &[("id", "TASK1"), ("state", "ready")])
            .unwrap();
        assert_eq!(out, "TASK1: TASK1 is ready");
    }

    #[test]
    fn render_rejects_missing_placeholder() {
        let err = render("hello {{who}}", &[("other", "x")]).unwrap_err();
        assert!(err.to_string().contains("who"));
    }

    #[test]
    fn render_allows_unused_values() {
        let out = render("plain text", &[("spare", "x")]).unwrap();
        assert_eq!(out, "plain text");
    }

    #[test]
    fn load_prefers_override_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("review.md"), "custom {{task_id}}").unwrap();
        assert_eq!(
            load(dir.path(), "review", "default {{task_id}}"),
            "custom {{task_id}}"
        );
        assert_eq!(load(dir.path(), "other", "default"), "default");
    }

    #[test]
    fn load_ignores_empty_override() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("review.md"), "  \n").unwrap();
        assert_eq!(load(dir.path(), "review", "default"), "default");
    }
}
