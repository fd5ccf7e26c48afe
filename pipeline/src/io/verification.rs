//! Verification engine: stage an edit set, run the repository's tests with
//! coverage, parse the report and put the working tree back.
//!
//! Every path the engine touches (edited files, their newly created parent
//! directories and the coverage report) is snapshotted before the first
//! write and restored afterwards, whatever the test command did.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::coverage::{PathResolver, map_to_edited_files};
use crate::core::types::{
    CoverageMap, DraftEdit, FailureCause, RepoSnapshot, TestExecutionReport,
};
use crate::io::config::PipelineConfig;
use crate::io::edits::{apply_edits, edit_target};
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::strategy::{TestStrategy, resolve_strategy};

const SNIPPET_ELLIPSIS: &str = "...";

pub trait TestVerifier: Send + Sync {
    /// Run the repository's tests against `edits` staged on disk.
    ///
    /// Test failures are reported, not returned as errors. An `Err` means the
    /// working tree could not be prepared or restored.
    fn verify(
        &self,
        repo: &Path,
        snapshot: &RepoSnapshot,
        edits: &[DraftEdit],
    ) -> Result<TestExecutionReport>;
}

/// Bounds applied to one verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationSettings {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub snippet_limit_bytes: usize,
}

impl VerificationSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.verification_timeout_secs),
            output_limit_bytes: config.verification_output_limit_bytes,
            snippet_limit_bytes: config.snippet_limit_bytes,
        }
    }
}

/// Production [`TestVerifier`].
pub struct VerificationEngine {
    settings: VerificationSettings,
    strategy: Option<TestStrategy>,
}

impl VerificationEngine {
    pub fn new(settings: VerificationSettings) -> Self {
        Self {
            settings,
            strategy: None,
        }
    }

    /// Use `strategy` instead of detecting one per repository.
    pub fn with_strategy(mut self, strategy: TestStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn strategy_for(&self, repo: &Path, snapshot: &RepoSnapshot) -> Option<TestStrategy> {
        self.strategy
            .clone()
            .or_else(|| resolve_strategy(repo, snapshot))
    }

    fn run_strategy(
        &self,
        repo: &Path,
        strategy: &TestStrategy,
        edits: &[DraftEdit],
    ) -> TestExecutionReport {
        let command_line = strategy.command_line();
        let mut report = TestExecutionReport::not_executed(Vec::new());
        report.command = Some(command_line.clone());

        let mut cmd = Command::new(&strategy.program);
        cmd.args(&strategy.args).current_dir(repo);
        info!(command = %command_line, "running tests");
        match run_command_with_timeout(
            cmd,
            None,
            self.settings.timeout,
            self.settings.output_limit_bytes,
        ) {
            Ok(output) => self.record_output(&mut report, &output),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "test command could not be started");
                report.failure_cause = Some(FailureCause::SpawnFailed);
                report.notes.push(format!("could not start `{command_line}`: {err:#}"));
            }
        }

        let edited: Vec<String> = edits.iter().map(|e| e.path.clone()).collect();
        let coverage = self.read_coverage(repo, strategy, &mut report.notes);
        let (files, overall) = map_to_edited_files(&coverage.unwrap_or_default(), &edited);
        report.file_coverage = files;
        report.overall_line_coverage_percent = overall;
        report
    }

    fn record_output(&self, report: &mut TestExecutionReport, output: &CommandOutput) {
        report.executed = true;
        report.success = output.success();
        report.failure_cause = if output.timed_out {
            report.notes.push(format!(
                "tests timed out after {}s",
                self.settings.timeout.as_secs()
            ));
            Some(FailureCause::TimedOut)
        } else if output.output_limit_exceeded {
            report.notes.push(format!(
                "test output exceeded {} bytes",
                self.settings.output_limit_bytes
            ));
            Some(FailureCause::OutputLimitExceeded)
        } else if !output.status.success() {
            Some(FailureCause::NonZeroExit)
        } else {
            None
        };
        let limit = self.settings.snippet_limit_bytes;
        report.stdout_snippet = snippet(&output.stdout_text(), limit);
        report.stderr_snippet = snippet(&output.stderr_text(), limit);
    }

    fn read_coverage(
        &self,
        repo: &Path,
        strategy: &TestStrategy,
        notes: &mut Vec<String>,
    ) -> Option<CoverageMap> {
        let report_path = repo.join(&strategy.report_path);
        let content = match fs::read_to_string(&report_path) {
            Ok(content) => content,
            Err(_) => {
                notes.push(format!(
                    "no coverage report at {}",
                    strategy.report_path.display()
                ));
                return None;
            }
        };
        let report_dir = report_path.parent().unwrap_or(repo);
        let resolver = PathResolver::new(repo)
            .with_report_dir(report_dir)
            .with_module_prefix(strategy.module_prefix.clone());
        match strategy.format.parse(&content, &resolver) {
            Ok(map) => {
                debug!(files = map.len(), format = strategy.format.as_str(), "parsed coverage");
                Some(map)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "coverage report unreadable");
                notes.push(format!(
                    "could not parse {} report: {err:#}",
                    strategy.format.as_str()
                ));
                None
            }
        }
    }
}

impl TestVerifier for VerificationEngine {
    #[instrument(skip_all, fields(repo = %repo.display(), edits = edits.len()))]
    fn verify(
        &self,
        repo: &Path,
        snapshot: &RepoSnapshot,
        edits: &[DraftEdit],
    ) -> Result<TestExecutionReport> {
        let Some(strategy) = self.strategy_for(repo, snapshot) else {
            info!("no test strategy applies");
            let languages = snapshot
                .language_summary
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let mut report = TestExecutionReport::not_executed(vec![format!(
                "no supported test/coverage command found (languages: {})",
                if languages.is_empty() { "none" } else { &languages }
            )]);
            let edited: Vec<String> = edits.iter().map(|e| e.path.clone()).collect();
            report.file_coverage = map_to_edited_files(&CoverageMap::new(), &edited).0;
            return Ok(report);
        };

        let mut targets = Vec::with_capacity(edits.len() + 1);
        for edit in edits {
            targets.push(edit_target(repo, &edit.path)?);
        }
        targets.push(repo.join(&strategy.report_path));
        let tree = TreeSnapshot::capture(repo, &targets)?;

        let staged = remove_if_present(&repo.join(&strategy.report_path))
            .and_then(|()| apply_edits(repo, edits));
        let outcome = staged.map(|()| self.run_strategy(repo, &strategy, edits));

        let restored = tree.restore();
        let report = outcome?;
        restored?;
        debug!(
            success = report.success,
            overall = ?report.overall_line_coverage_percent,
            "verification finished"
        );
        Ok(report)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Tail of `text`, at most `limit` bytes; `None` when there is nothing to show.
fn snippet(text: &str, limit: usize) -> Option<String> {
    let trimmed = text.trim_end();
    if trimmed.trim().is_empty() {
        return None;
    }
    if trimmed.len() <= limit {
        return Some(trimmed.to_string());
    }
    let mut start = trimmed.len() - limit.saturating_sub(SNIPPET_ELLIPSIS.len());
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    Some(format!("{SNIPPET_ELLIPSIS}{}", &trimmed[start..]))
}

/// Content (or absence) of a set of paths, plus directories that did not exist.
struct TreeSnapshot {
    files: Vec<(PathBuf, Option<Vec<u8>>)>,
    /// Outermost missing ancestors, removed wholesale on restore.
    missing_dirs: Vec<PathBuf>,
}

impl TreeSnapshot {
    fn capture(repo: &Path, paths: &[PathBuf]) -> Result<Self> {
        let mut files: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
        let mut missing_dirs: Vec<PathBuf> = Vec::new();
        for path in paths {
            if files.iter().any(|(seen, _)| seen == path) {
                continue;
            }
            let original = if path.is_file() {
                Some(fs::read(path).with_context(|| format!("read {}", path.display()))?)
            } else {
                None
            };
            if let Some(dir) = outermost_missing_dir(repo, path)
                && !missing_dirs.contains(&dir)
            {
                missing_dirs.push(dir);
            }
            files.push((path.clone(), original));
        }
        Ok(Self {
            files,
            missing_dirs,
        })
    }

    /// Put every path back; attempts all of them before reporting a failure.
    fn restore(self) -> Result<()> {
        let mut first_error = None;
        for (path, original) in &self.files {
            let result = match original {
                Some(bytes) => {
                    fs::write(path, bytes).with_context(|| format!("restore {}", path.display()))
                }
                None => remove_if_present(path),
            };
            if let Err(err) = result {
                warn!(path = %path.display(), error = %format!("{err:#}"), "restore failed");
                first_error.get_or_insert(err);
            }
        }
        for dir in &self.missing_dirs {
            if dir.exists()
                && let Err(err) = fs::remove_dir_all(dir)
            {
                warn!(path = %dir.display(), %err, "could not remove staged directory");
                let err = anyhow::Error::new(err).context(format!("remove {}", dir.display()));
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn outermost_missing_dir(repo: &Path, path: &Path) -> Option<PathBuf> {
    let mut outermost = None;
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == repo || !dir.starts_with(repo) || dir.exists() {
            break;
        }
        outermost = Some(dir.to_path_buf());
        current = dir.parent();
    }
    outermost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coverage::CoverageFormat;
    use crate::io::strategy::StrategyKind;

    fn settings() -> VerificationSettings {
        VerificationSettings {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 64 * 1024,
            snippet_limit_bytes: 200,
        }
    }

    fn sh(script: &str, report: &str, format: CoverageFormat) -> TestStrategy {
        TestStrategy {
            kind: StrategyKind::Custom,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            report_path: PathBuf::from(report),
            format,
            module_prefix: None,
        }
    }

    fn edit(path: &str, content: &str) -> DraftEdit {
        DraftEdit {
            path: path.to_string(),
            content: content.to_string(),
            rationale: String::new(),
        }
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    fn read(root: &Path, rel: &str) -> Option<String> {
        fs::read_to_string(root.join(rel)).ok()
    }

    const LCOV: &str = "TN:\\nSF:src/a.ts\\nDA:1,1\\nDA:2,1\\nDA:3,1\\nDA:4,1\\nDA:5,1\\nDA:6,1\\nDA:7,1\\nDA:8,1\\nDA:9,0\\nDA:10,0\\nend_of_record\\n";

    #[test]
    fn successful_run_maps_coverage_and_restores_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "src/a.ts", "original\n");
        write(root, "coverage/lcov.info", "stale\n");

        let script = format!(
            "grep -q staged src/a.ts && mkdir -p coverage && printf '{LCOV}' > coverage/lcov.info && echo ok"
        );
        let engine = VerificationEngine::new(settings())
            .with_strategy(sh(&script, "coverage/lcov.info", CoverageFormat::Lcov));
        let report = engine
            .verify(
                root,
                &RepoSnapshot::default(),
                &[edit("src/a.ts", "staged\n"), edit("src/new/a.test.ts", "t\n")],
            )
            .expect("verify");

        assert!(report.executed);
        assert!(report.success, "{report:?}");
        assert_eq!(report.failure_cause, None);
        assert_eq!(report.file_coverage[0].covered_lines, 8);
        assert_eq!(report.file_coverage[0].total_lines, 10);
        assert_eq!(report.file_coverage[0].line_coverage_percent, Some(80.0));
        assert_eq!(report.file_coverage[1].line_coverage_percent, None);
        assert_eq!(report.overall_line_coverage_percent, Some(80.0));
        assert_eq!(report.stdout_snippet.as_deref(), Some("ok"));

        assert_eq!(read(root, "src/a.ts").as_deref(), Some("original\n"));
        assert!(!root.join("src/new").exists());
        assert_eq!(read(root, "coverage/lcov.info").as_deref(), Some("stale\n"));
    }

    #[test]
    fn failing_command_still_parses_report_and_restores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let script = "printf 'mode: set\\nexample.com/m/pkg/a.go:1.1,3.2 4 0\\n' > coverage.out; echo FAIL >&2; exit 1";
        let mut strategy = sh(script, "coverage.out", CoverageFormat::GoProfile);
        strategy.module_prefix = Some("example.com/m".to_string());
        let engine = VerificationEngine::new(settings()).with_strategy(strategy);
        let report = engine
            .verify(root, &RepoSnapshot::default(), &[edit("pkg/a.go", "package pkg\n")])
            .expect("verify");

        assert!(report.executed);
        assert!(!report.success);
        assert_eq!(report.failure_cause, Some(FailureCause::NonZeroExit));
        assert_eq!(report.stderr_snippet.as_deref(), Some("FAIL"));
        assert_eq!(report.file_coverage[0].covered_lines, 0);
        assert_eq!(report.file_coverage[0].total_lines, 4);
        assert_eq!(report.overall_line_coverage_percent, Some(0.0));
        assert!(!root.join("pkg").exists());
        assert!(!root.join("coverage.out").exists());
    }

    #[test]
    fn timeout_is_a_failed_report_and_tree_is_restored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "app.py", "print('v1')\n");
        let engine = VerificationEngine::new(VerificationSettings {
            timeout: Duration::from_millis(200),
            ..settings()
        })
        .with_strategy(sh("exec sleep 5", "coverage.xml", CoverageFormat::CoberturaXml));
        let report = engine
            .verify(root, &RepoSnapshot::default(), &[edit("app.py", "print('v2')\n")])
            .expect("verify");

        assert!(!report.success);
        assert_eq!(report.failure_cause, Some(FailureCause::TimedOut));
        assert_eq!(report.overall_line_coverage_percent, None);
        assert!(report.notes.iter().any(|n| n.contains("no coverage report")));
        assert_eq!(read(root, "app.py").as_deref(), Some("print('v1')\n"));
    }

    #[test]
    fn timeout_bounds_a_process_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "app.py", "print('v1')\n");
        let engine = VerificationEngine::new(VerificationSettings {
            timeout: Duration::from_millis(200),
            ..settings()
        })
        .with_strategy(sh("sleep 5; true", "coverage.xml", CoverageFormat::CoberturaXml));
        let started = std::time::Instant::now();
        let report = engine
            .verify(root, &RepoSnapshot::default(), &[edit("app.py", "print('v2')\n")])
            .expect("verify");

        assert_eq!(report.failure_cause, Some(FailureCause::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert_eq!(read(root, "app.py").as_deref(), Some("print('v1')\n"));
    }

    #[test]
    fn detached_writer_cannot_touch_the_restored_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "a.ts", "original\n");
        let engine = VerificationEngine::new(VerificationSettings {
            timeout: Duration::from_millis(200),
            ..settings()
        })
        .with_strategy(sh(
            "(sleep 1; echo late > a.ts) >/dev/null 2>&1 & sleep 5",
            "lcov.info",
            CoverageFormat::Lcov,
        ));
        let report = engine
            .verify(root, &RepoSnapshot::default(), &[edit("a.ts", "staged\n")])
            .expect("verify");

        assert_eq!(report.failure_cause, Some(FailureCause::TimedOut));
        assert_eq!(read(root, "a.ts").as_deref(), Some("original\n"));
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(read(root, "a.ts").as_deref(), Some("original\n"));
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut strategy = sh("", "lcov.info", CoverageFormat::Lcov);
        strategy.program = "definitely-not-a-real-test-runner".to_string();
        strategy.args.clear();
        let engine = VerificationEngine::new(settings()).with_strategy(strategy);
        let report = engine
            .verify(temp.path(), &RepoSnapshot::default(), &[edit("a.ts", "x")])
            .expect("verify");
        assert!(!report.executed);
        assert_eq!(report.failure_cause, Some(FailureCause::SpawnFailed));
        assert!(!temp.path().join("a.ts").exists());
    }

    #[test]
    fn unparseable_report_becomes_a_note() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = VerificationEngine::new(settings()).with_strategy(sh(
            "echo 'not xml' > jacoco.xml",
            "jacoco.xml",
            CoverageFormat::JacocoXml,
        ));
        let report = engine
            .verify(temp.path(), &RepoSnapshot::default(), &[edit("A.java", "class A {}")])
            .expect("verify");
        assert!(report.success);
        assert!(report.notes.iter().any(|n| n.contains("could not parse jacoco")));
        assert_eq!(report.file_coverage[0].line_coverage_percent, None);
    }

    #[test]
    fn no_strategy_is_not_executed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = VerificationEngine::new(settings())
            .verify(temp.path(), &RepoSnapshot::default(), &[edit("main.rs", "fn main() {}")])
            .expect("verify");
        assert!(!report.executed);
        assert_eq!(report.command, None);
        assert_eq!(report.file_coverage.len(), 1);
        assert!(report.notes[0].contains("no supported test/coverage command"));
        assert!(!temp.path().join("main.rs").exists());
    }

    #[test]
    fn snippets_keep_the_tail() {
        assert_eq!(snippet("  \n", 10), None);
        assert_eq!(snippet("short\n", 10).as_deref(), Some("short"));
        assert_eq!(snippet("0123456789abcdef", 8).as_deref(), Some("...bcdef"));
    }
}
