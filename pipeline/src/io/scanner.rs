//! Repository scanner: language mix, manifests, and a sample of files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::types::RepoSnapshot;
use crate::io::config::ScannerConfig;

/// Directories never worth scanning.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".pipeline",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "out",
    "coverage",
    ".next",
    ".gradle",
    ".idea",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
];

pub trait RepoScanner: Send + Sync {
    fn scan(&self, repo: &Path) -> Result<RepoSnapshot>;
}

/// [`RepoScanner`] walking the working tree with `walkdir`.
pub struct FsScanner {
    config: ScannerConfig,
}

impl FsScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }
}

impl RepoScanner for FsScanner {
    #[instrument(skip_all, fields(repo = %repo.display()))]
    fn scan(&self, repo: &Path) -> Result<RepoSnapshot> {
        if !repo.is_dir() {
            return Err(anyhow!("repository path {} is not a directory", repo.display()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(repo)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(repo)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push(relative);
            if files.len() >= self.config.max_files {
                warn!(max_files = self.config.max_files, "file limit reached, scan truncated");
                break;
            }
        }

        let mut language_summary = BTreeMap::new();
        for path in &files {
            if let Some(language) = language_for(path) {
                *language_summary.entry(language.to_string()).or_insert(0) += 1;
            }
        }

        let top_level_entries = top_level_entries(repo)?;
        let tech_stack = detect_tech_stack(repo);
        let testing_guidance = testing_guidance(&tech_stack, &language_summary);
        let sample_files = sample_files(&files, self.config.sample_files);

        debug!(
            file_count = files.len(),
            languages = language_summary.len(),
            "scanned repository"
        );
        Ok(RepoSnapshot {
            file_count: files.len(),
            top_level_entries,
            language_summary,
            sample_files,
            tech_stack,
            testing_guidance,
        })
    }
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Language name for a path, by extension.
pub fn language_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let language = match ext.as_str() {
        "ts" | "tsx" | "mts" | "cts" => "TypeScript",
        "js" | "jsx" | "mjs" | "cjs" => "JavaScript",
        "py" => "Python",
        "go" => "Go",
        "java" => "Java",
        "kt" | "kts" => "Kotlin",
        "scala" => "Scala",
        "rs" => "Rust",
        "rb" => "Ruby",
        "cs" => "C#",
        "php" => "PHP",
        "swift" => "Swift",
        "vue" => "Vue",
        "svelte" => "Svelte",
        "sql" => "SQL",
        "sh" | "bash" => "Shell",
        "html" => "HTML",
        "css" | "scss" | "sass" => "CSS",
        "json" => "JSON",
        "yaml" | "yml" => "YAML",
        "toml" => "TOML",
        "md" => "Markdown",
        _ => return None,
    };
    Some(language)
}

fn top_level_entries(repo: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(repo).with_context(|| format!("read dir {}", repo.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", repo.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".git" {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        entries.push(if is_dir { format!("{name}/") } else { name });
    }
    entries.sort();
    Ok(entries)
}

/// Prefer code files; fill the remainder with anything else, in walk order.
fn sample_files(files: &[String], limit: usize) -> Vec<String> {
    let is_code = |path: &&String| {
        language_for(path).is_some_and(|lang| {
            !matches!(lang, "JSON" | "YAML" | "TOML" | "Markdown")
        })
    };
    let mut sample: Vec<String> = files.iter().filter(is_code).take(limit).cloned().collect();
    if sample.len() < limit {
        let rest = files
            .iter()
            .filter(|path| !is_code(path))
            .take(limit - sample.len())
            .cloned();
        sample.extend(rest);
    }
    sample
}

fn detect_tech_stack(repo: &Path) -> Vec<String> {
    let mut stack = Vec::new();
    let mut push = |item: &str| {
        if !stack.iter().any(|s: &String| s == item) {
            stack.push(item.to_string());
        }
    };

    if let Ok(manifest) = fs::read_to_string(repo.join("package.json")) {
        push("Node.js");
        for (needle, label) in [
            ("\"typescript\"", "TypeScript"),
            ("\"react\"", "React"),
            ("\"next\"", "Next.js"),
            ("\"vue\"", "Vue"),
            ("\"express\"", "Express"),
            ("\"@nestjs/core\"", "NestJS"),
            ("\"jest\"", "Jest"),
            ("\"vitest\"", "Vitest"),
            ("\"mocha\"", "Mocha"),
        ] {
            if manifest.contains(needle) {
                push(label);
            }
        }
    }
    if repo.join("pnpm-lock.yaml").exists() {
        push("pnpm");
    } else if repo.join("yarn.lock").exists() {
        push("Yarn");
    }

    let python_manifests = ["pyproject.toml", "requirements.txt", "setup.py", "setup.cfg"];
    if python_manifests.iter().any(|m| repo.join(m).exists()) {
        push("Python");
        let mentions_pytest = python_manifests
            .iter()
            .filter_map(|m| fs::read_to_string(repo.join(m)).ok())
            .any(|text| text.contains("pytest"));
        if mentions_pytest || repo.join("pytest.ini").exists() || repo.join("conftest.py").exists()
        {
            push("pytest");
        }
    }
    if repo.join("go.mod").exists() {
        push("Go modules");
    }
    if repo.join("pom.xml").exists() {
        push("Maven");
    }
    if repo.join("build.gradle").exists() || repo.join("build.gradle.kts").exists() {
        push("Gradle");
    }
    if repo.join("Cargo.toml").exists() {
        push("Cargo");
    }
    stack
}

fn testing_guidance(stack: &[String], languages: &BTreeMap<String, usize>) -> String {
    let has = |item: &str| stack.iter().any(|s| s == item);
    let mut lines = Vec::new();
    if has("Vitest") {
        lines.push("Write Vitest specs next to the module as `<name>.test.ts`.");
    } else if has("Jest") || has("Node.js") {
        lines.push("Write Jest tests as `<name>.test.ts` (or `.test.js`) or under `__tests__/`.");
    }
    if has("Python") || languages.contains_key("Python") {
        lines.push("Write pytest tests in `tests/test_<module>.py` using plain `assert`.");
    }
    if has("Go modules") || languages.contains_key("Go") {
        lines.push("Write table-driven tests in `<file>_test.go` in the same package.");
    }
    if has("Maven") || has("Gradle") {
        lines.push("Write JUnit 5 tests under `src/test/java` named `<Class>Test`.");
    }
    if lines.is_empty() {
        lines.push("Follow the repository's existing test layout and naming.");
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn scans_languages_manifests_and_skips_ignored_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "package.json", r#"{"devDependencies":{"vitest":"1"}}"#);
        write(root, "src/a.ts", "export const a = 1;\n");
        write(root, "src/b.ts", "export const b = 2;\n");
        write(root, "src/a.test.ts", "test('a', () => {});\n");
        write(root, "scripts/run.js", "\n");
        write(root, "node_modules/x/index.js", "\n");
        write(root, "README.md", "# hi\n");

        let snapshot = FsScanner::new(ScannerConfig::default())
            .scan(root)
            .expect("scan");
        assert_eq!(snapshot.file_count, 6);
        assert_eq!(snapshot.language_summary["TypeScript"], 3);
        assert_eq!(snapshot.language_summary["JavaScript"], 1);
        assert!(!snapshot.sample_files.iter().any(|p| p.contains("node_modules")));
        assert_eq!(snapshot.sample_files[0], "scripts/run.js");
        assert!(snapshot.top_level_entries.contains(&"src/".to_string()));
        assert!(snapshot.tech_stack.contains(&"Vitest".to_string()));
        assert!(snapshot.testing_guidance.contains("Vitest"));
    }

    #[test]
    fn sample_and_file_limits_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        for i in 0..10 {
            write(temp.path(), &format!("pkg/f{i}.go"), "package pkg\n");
        }
        write(temp.path(), "go.mod", "module example.com/m\n");
        let snapshot = FsScanner::new(ScannerConfig {
            sample_files: 3,
            max_files: 5,
        })
        .scan(temp.path())
        .expect("scan");
        assert_eq!(snapshot.file_count, 5);
        assert_eq!(snapshot.sample_files.len(), 3);
        assert!(snapshot.tech_stack.contains(&"Go modules".to_string()));
    }

    #[test]
    fn missing_repository_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = FsScanner::new(ScannerConfig::default())
            .scan(&temp.path().join("nope"))
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
