//! Unit-test gate: source changes must travel with test changes.

use std::collections::BTreeMap;

use crate::core::types::DraftEdit;

/// Appended to the feedback of the next drafting request after a gate failure.
pub const CORRECTIVE_INSTRUCTION: &str = "The previous edit set changed source files without \
adding or updating unit tests. Return the complete edit set again and include at least one \
test file that exercises the changed code, following the repository's test conventions.";

/// Languages whose repositories must ship tests with source changes.
const TESTED_LANGUAGES: &[&str] = &["TypeScript", "JavaScript", "Python", "Go", "Java", "Kotlin"];

const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "kts", "scala", "rs", "rb",
    "cs", "php", "swift", "vue", "svelte",
];

const TEST_DIRS: &[&str] = &["test", "tests", "__tests__"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail { reason: String },
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }
}

/// Decide whether `edits` satisfy the gate for a repository with the given
/// language mix (language name -> file count).
pub fn evaluate_gate(edits: &[DraftEdit], languages: &BTreeMap<String, usize>) -> GateVerdict {
    if edits.is_empty() {
        return GateVerdict::Fail {
            reason: "edit set is empty".to_string(),
        };
    }
    let sources: Vec<&str> = edits
        .iter()
        .map(|edit| edit.path.as_str())
        .filter(|path| is_source_path(path))
        .collect();
    if sources.is_empty() || !requires_tests(languages) {
        return GateVerdict::Pass;
    }
    if edits.iter().any(|edit| is_test_path(&edit.path)) {
        return GateVerdict::Pass;
    }
    GateVerdict::Fail {
        reason: format!(
            "source files changed without tests: {}",
            sources.join(", ")
        ),
    }
}

/// True when the language mix contains a language that requires tests.
pub fn requires_tests(languages: &BTreeMap<String, usize>) -> bool {
    languages
        .iter()
        .any(|(name, count)| *count > 0 && TESTED_LANGUAGES.contains(&name.as_str()))
}

/// Source file by extension, excluding anything that looks like a test.
pub fn is_source_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return false;
    };
    SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) && !is_test_path(&normalized)
}

/// Test-path heuristic covering test directories and per-language file
/// naming conventions.
pub fn is_test_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    let Some(file_name) = segments.pop() else {
        return false;
    };
    if segments
        .iter()
        .any(|dir| TEST_DIRS.contains(&dir.to_ascii_lowercase().as_str()))
    {
        return true;
    }

    let lower = file_name.to_ascii_lowercase();
    if lower.contains(".test.") || lower.contains(".spec.") {
        return true;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
        None => (file_name, String::new()),
    };
    let stem_lower = stem.to_ascii_lowercase();
    if stem_lower.ends_with("_test") {
        return true;
    }
    match ext.as_str() {
        "py" => stem_lower.starts_with("test_") || stem_lower == "conftest",
        "rb" => stem_lower.ends_with("_spec"),
        "java" | "kt" | "kts" | "scala" | "groovy" => {
            stem.ends_with("Test")
                || stem.ends_with("Tests")
                || stem.ends_with("IT")
                || stem.starts_with("Test")
        }
        _ => false,
    }
}
