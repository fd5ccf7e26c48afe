//! Test strategy resolution: which command proves a change, and where its
//! coverage report lands.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::core::coverage::CoverageFormat;
use crate::core::types::RepoSnapshot;

const PYTHON_MARKERS: &[&str] = &[
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "requirements.txt",
    "pytest.ini",
    "tox.ini",
    "conftest.py",
];

/// Toolchain family a strategy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Node,
    Python,
    Go,
    Maven,
    Gradle,
    /// Supplied explicitly rather than detected.
    Custom,
}

impl StrategyKind {
    fn languages(&self) -> &'static [&'static str] {
        match self {
            StrategyKind::Node => &["TypeScript", "JavaScript"],
            StrategyKind::Python => &["Python"],
            StrategyKind::Go => &["Go"],
            StrategyKind::Maven | StrategyKind::Gradle => &["Java", "Kotlin"],
            StrategyKind::Custom => &[],
        }
    }
}

/// A resolved test/coverage command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStrategy {
    pub kind: StrategyKind,
    pub program: String,
    pub args: Vec<String>,
    /// Report location relative to the repository root.
    pub report_path: PathBuf,
    pub format: CoverageFormat,
    /// Go module path, stripped from profile entries.
    pub module_prefix: Option<String>,
}

impl TestStrategy {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn strategy(
    kind: StrategyKind,
    program: impl Into<String>,
    args: &[&str],
    report_path: &str,
    format: CoverageFormat,
) -> TestStrategy {
    TestStrategy {
        kind,
        program: program.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        report_path: PathBuf::from(report_path),
        format,
        module_prefix: None,
    }
}

/// Pick exactly one strategy for `repo`, or `None` when nothing applies.
///
/// Every toolchain with a manifest is a candidate; the one whose languages
/// account for the most files wins, ties going to the earlier candidate.
pub fn resolve_strategy(repo: &Path, snapshot: &RepoSnapshot) -> Option<TestStrategy> {
    let candidates: Vec<TestStrategy> = [
        node_strategy(repo),
        python_strategy(repo),
        go_strategy(repo),
        maven_strategy(repo),
        gradle_strategy(repo),
    ]
    .into_iter()
    .flatten()
    .collect();

    let weight = |candidate: &TestStrategy| -> usize {
        candidate
            .kind
            .languages()
            .iter()
            .filter_map(|lang| snapshot.language_summary.get(*lang))
            .sum()
    };
    let mut best: Option<(usize, TestStrategy)> = None;
    for candidate in candidates {
        let score = weight(&candidate);
        if best.as_ref().is_none_or(|(top, _)| score > *top) {
            best = Some((score, candidate));
        }
    }
    let chosen = best.map(|(_, candidate)| candidate);
    debug!(strategy = ?chosen.as_ref().map(|s| s.kind), "resolved test strategy");
    chosen
}

fn node_strategy(repo: &Path) -> Option<TestStrategy> {
    let manifest = fs::read_to_string(repo.join("package.json")).ok()?;
    let pm = if repo.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if repo.join("yarn.lock").exists() {
        "yarn"
    } else {
        "npm"
    };
    let report = "coverage/lcov.info";
    let s = if manifest.contains("\"vitest\"") {
        let exec = if pm == "npm" { "npx" } else { pm };
        let mut args = Vec::new();
        if exec != "npx" {
            args.push("exec");
        }
        args.extend(["vitest", "run", "--coverage", "--coverage.reporter=lcov"]);
        strategy(StrategyKind::Node, exec, &args, report, CoverageFormat::Lcov)
    } else {
        let args: &[&str] = if pm == "yarn" {
            &["test", "--coverage", "--coverageReporters=lcov"]
        } else {
            &["test", "--", "--coverage", "--coverageReporters=lcov"]
        };
        strategy(StrategyKind::Node, pm, args, report, CoverageFormat::Lcov)
    };
    Some(s)
}

fn python_strategy(repo: &Path) -> Option<TestStrategy> {
    if !PYTHON_MARKERS.iter().any(|m| repo.join(m).exists()) {
        return None;
    }
    Some(strategy(
        StrategyKind::Python,
        "python3",
        &["-m", "pytest", "--cov=.", "--cov-report=xml:coverage.xml"],
        "coverage.xml",
        CoverageFormat::CoberturaXml,
    ))
}

fn go_strategy(repo: &Path) -> Option<TestStrategy> {
    let go_mod = fs::read_to_string(repo.join("go.mod")).ok()?;
    let mut s = strategy(
        StrategyKind::Go,
        "go",
        &["test", "./...", "-coverprofile=coverage.out"],
        "coverage.out",
        CoverageFormat::GoProfile,
    );
    s.module_prefix = module_path(&go_mod);
    Some(s)
}

/// `module` directive of a go.mod file.
pub fn module_path(go_mod: &str) -> Option<String> {
    go_mod.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("module")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let name = rest.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

fn maven_strategy(repo: &Path) -> Option<TestStrategy> {
    if !repo.join("pom.xml").exists() {
        return None;
    }
    let program = if repo.join("mvnw").exists() { "./mvnw" } else { "mvn" };
    Some(strategy(
        StrategyKind::Maven,
        program,
        &["-B", "test", "jacoco:report"],
        "target/site/jacoco/jacoco.xml",
        CoverageFormat::JacocoXml,
    ))
}

fn gradle_strategy(repo: &Path) -> Option<TestStrategy> {
    if !repo.join("build.gradle").exists() && !repo.join("build.gradle.kts").exists() {
        return None;
    }
    let program = if repo.join("gradlew").exists() {
        "./gradlew"
    } else {
        "gradle"
    };
    Some(strategy(
        StrategyKind::Gradle,
        program,
        &["test", "jacocoTestReport"],
        "build/reports/jacoco/test/jacocoTestReport.xml",
        CoverageFormat::JacocoXml,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn langs(pairs: &[(&str, usize)]) -> RepoSnapshot {
        RepoSnapshot {
            language_summary: pairs
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect::<BTreeMap<_, _>>(),
            ..RepoSnapshot::default()
        }
    }

    #[test]
    fn no_manifest_means_no_strategy() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(resolve_strategy(temp.path(), &langs(&[("Rust", 3)])), None);
    }

    #[test]
    fn node_uses_lockfile_package_manager() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("package.json"), r#"{"devDependencies":{"jest":"29"}}"#)
            .expect("write");
        fs::write(temp.path().join("pnpm-lock.yaml"), "").expect("write");
        let s = resolve_strategy(temp.path(), &langs(&[("TypeScript", 4)])).expect("strategy");
        assert_eq!(s.kind, StrategyKind::Node);
        assert_eq!(
            s.command_line(),
            "pnpm test -- --coverage --coverageReporters=lcov"
        );
        assert_eq!(s.report_path, PathBuf::from("coverage/lcov.info"));
        assert_eq!(s.format, CoverageFormat::Lcov);
    }

    #[test]
    fn vitest_runs_through_npx() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("package.json"), r#"{"devDependencies":{"vitest":"1"}}"#)
            .expect("write");
        let s = resolve_strategy(temp.path(), &langs(&[])).expect("strategy");
        assert_eq!(
            s.command_line(),
            "npx vitest run --coverage --coverage.reporter=lcov"
        );
    }

    #[test]
    fn dominant_language_wins_between_manifests() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("package.json"), "{}").expect("write");
        fs::write(temp.path().join("go.mod"), "module github.com/acme/svc\n\ngo 1.22\n")
            .expect("write");
        let s = resolve_strategy(
            temp.path(),
            &langs(&[("Go", 30), ("JavaScript", 2)]),
        )
        .expect("strategy");
        assert_eq!(s.kind, StrategyKind::Go);
        assert_eq!(s.module_prefix.as_deref(), Some("github.com/acme/svc"));
        assert_eq!(s.format, CoverageFormat::GoProfile);
    }

    #[test]
    fn jvm_prefers_wrappers() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("build.gradle.kts"), "").expect("write");
        fs::write(temp.path().join("gradlew"), "").expect("write");
        let s = resolve_strategy(temp.path(), &langs(&[("Kotlin", 5)])).expect("strategy");
        assert_eq!(s.program, "./gradlew");
        assert_eq!(
            s.report_path,
            PathBuf::from("build/reports/jacoco/test/jacocoTestReport.xml")
        );

        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("pom.xml"), "<project/>").expect("write");
        let s = resolve_strategy(temp.path(), &langs(&[("Java", 5)])).expect("strategy");
        assert_eq!(s.command_line(), "mvn -B test jacoco:report");
        assert_eq!(s.format, CoverageFormat::JacocoXml);
    }

    #[test]
    fn python_reports_cobertura_xml() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("pyproject.toml"), "[project]\nname='x'\n").expect("write");
        let s = resolve_strategy(temp.path(), &langs(&[("Python", 8)])).expect("strategy");
        assert_eq!(s.format, CoverageFormat::CoberturaXml);
        assert_eq!(s.report_path, PathBuf::from("coverage.xml"));
    }

    #[test]
    fn module_directive_parsing() {
        assert_eq!(module_path("module \"x.io/y\"\n").as_deref(), Some("x.io/y"));
        assert_eq!(module_path("modulex foo\n"), None);
        assert_eq!(module_path("go 1.21\n"), None);
    }
}
