//! Context-chain extraction from a blueprint.
//!
//! The blueprint's `## 2. CONTEXT CHAIN` section lists the files a reviewer
//! must read. Extracted paths plus the execution record's artifacts form the
//! review's reading list, bounded to keep the prompt within reason.

use crate::store::execution::Artifact;

/// Extensions considered reviewable (source, config, docs).
const REVIEW_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "rb", "sql", "sh", "css", "html",
    "json", "toml", "yaml", "yml", "md",
];

fn has_review_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| REVIEW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Paths listed in the blueprint's context-chain section.
///
/// Accepts `- path` and `* `path`` bullet forms; anything without a
/// reviewable extension is dropped.
pub fn extract_context_chain(blueprint: &str) -> Vec<String> {
    let mut in_section = false;
    let mut paths = Vec::new();
    for line in blueprint.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("## ") {
            in_section = trimmed.to_ascii_lowercase().contains("context chain");
            continue;
        }
        if !in_section {
            continue;
        }
        let Some(raw) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        else {
            continue;
        };
        let path = raw.trim().trim_matches('`').trim();
        if !path.is_empty() && has_review_extension(path) && !paths.contains(&path.to_string()) {
            paths.push(path.to_string());
        }
    }
    paths
}

/// Context-chain paths plus artifact paths, deduplicated in order and capped.
pub fn reading_list(blueprint: &str, artifacts: &[Artifact], cap: usize) -> Vec<String> {
    let mut list = extract_context_chain(blueprint);
    for artifact in artifacts {
        let path = artifact.path.trim();
        if !path.is_empty() && !list.contains(&path.to_string()) {
            list.push(path.to_string());
        }
    }
    list.truncate(cap);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    const BLUEPRINT: &str = "\
# TASK3

## 1. IDENTITY
@difficulty medium

## 2. CONTEXT CHAIN
- src/api/router.rs
* `src/api/middleware.rs`
- docs/auth.md
- assets/logo.png
not a bullet src/ignored.rs

## 3. EXECUTION CONTRACT
- phase one
";

    fn artifact(path: &str) -> Artifact {
        Artifact {
            kind: "file".into(),
            path: path.into(),
            extra: Map::new(),
        }
    }

    #[test]
    fn extracts_bulleted_paths_from_the_section_only() {
        let paths = extract_context_chain(BLUEPRINT);
        assert_eq!(
            paths,
            vec!["src/api/router.rs", "src/api/middleware.rs", "docs/auth.md"]
        );
    }

    #[test]
    fn extension_filter_drops_binaries() {
        let paths = extract_context_chain(BLUEPRINT);
        assert!(!paths.iter().any(|p| p.ends_with(".png")));
    }

    #[test]
    fn section_bullets_outside_context_chain_are_ignored() {
        // "phase one" lives in the execution contract section.
        let paths = extract_context_chain(BLUEPRINT);
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn missing_section_yields_empty_chain() {
        assert!(extract_context_chain("# Blueprint without sections\n").is_empty());
    }

    #[test]
    fn reading_list_merges_artifacts_without_duplicates() {
        let artifacts = vec![
            artifact("src/api/router.rs"),
            artifact("src/api/new_handler.rs"),
            artifact(""),
        ];
        let list = reading_list(BLUEPRINT, &artifacts, 10);
        assert_eq!(
            list,
            vec![
                "src/api/router.rs",
                "src/api/middleware.rs",
                "docs/auth.md",
                "src/api/new_handler.rs"
            ]
        );
    }

    #[test]
    fn reading_list_is_capped() {
        let artifacts: Vec<Artifact> = (0..20)
            .map(|i| artifact(&format!("src/file{i}.rs")))
            .collect();
        let list = reading_list(BLUEPRINT, &artifacts, 5);
        assert_eq!(list.len(), 5);
        // Chain paths keep priority over artifacts.
        assert_eq!(list[0], "src/api/router.rs");
    }
}
