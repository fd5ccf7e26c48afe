//! Pipeline command-line tools.
//!
//! Exposes the verification gate pieces on their own: run a repository's
//! tests against an edit set, parse a coverage report, evaluate the
//! unit-test gate, or normalize a reasoning-service response to JSON.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use pipeline::core::coverage::{CoverageFormat, PathResolver};
use pipeline::core::response::interpret;
use pipeline::core::schema::decode_draft;
use pipeline::core::types::DraftEdit;
use pipeline::core::unit_test_gate::{GateVerdict, evaluate_gate};
use pipeline::exit_codes;
use pipeline::io::config::{PipelineConfig, load_config, write_config};
use pipeline::io::scanner::{FsScanner, RepoScanner};
use pipeline::io::strategy::{StrategyKind, TestStrategy, module_path};
use pipeline::io::verification::{TestVerifier, VerificationEngine, VerificationSettings};

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Verification gate tools for the ticket-to-change pipeline"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage an edit set, run the repository's tests with coverage, restore.
    Verify {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// JSON file: an array of edits or `{"edits": [...]}`.
        #[arg(long)]
        edits: PathBuf,
        /// Run this shell command instead of the detected strategy.
        #[arg(long, requires_all = ["format", "report"])]
        command: Option<String>,
        /// Report format for `--command`.
        #[arg(long)]
        format: Option<CoverageFormat>,
        /// Report path for `--command`, relative to the repository.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Timeout override in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Parse a coverage report into per-file line counts.
    Coverage {
        #[arg(long)]
        format: CoverageFormat,
        #[arg(long)]
        report: PathBuf,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Evaluate the unit-test gate for an edit set.
    Gate {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        edits: PathBuf,
    },
    /// Read a reasoning-service response on stdin and print its JSON value.
    ExtractJson,
    /// Write a config file with every default spelled out.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    pipeline::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Verify {
            repo,
            edits,
            command,
            format,
            report,
            timeout_secs,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(secs) = timeout_secs {
                config.verification_timeout_secs = secs;
            }
            let custom = match (command, format, report) {
                (Some(command), Some(format), Some(report)) => {
                    Some(shell_strategy(&repo, command, format, report))
                }
                _ => None,
            };
            cmd_verify(&config, &repo, &edits, custom)
        }
        Command::Coverage {
            format,
            report,
            repo,
        } => cmd_coverage(format, &report, &repo),
        Command::Gate { repo, edits } => {
            let config = load_config(&cli.config)?;
            cmd_gate(&config, &repo, &edits)
        }
        Command::ExtractJson => cmd_extract_json(),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_verify(
    config: &PipelineConfig,
    repo: &Path,
    edits_path: &Path,
    custom: Option<TestStrategy>,
) -> Result<i32> {
    let edits = read_edits(edits_path)?;
    let snapshot = FsScanner::new(config.scanner.clone()).scan(repo)?;
    let mut engine = VerificationEngine::new(VerificationSettings::from_config(config));
    if let Some(strategy) = custom {
        engine = engine.with_strategy(strategy);
    }
    let report = engine.verify(repo, &snapshot, &edits)?;
    print_json(&report)?;
    Ok(if report.success {
        exit_codes::OK
    } else if report.executed {
        exit_codes::TESTS_FAILED
    } else {
        exit_codes::NOT_EXECUTED
    })
}

fn cmd_coverage(format: CoverageFormat, report: &Path, repo: &Path) -> Result<i32> {
    let content =
        fs::read_to_string(report).with_context(|| format!("read {}", report.display()))?;
    let module_prefix = fs::read_to_string(repo.join("go.mod"))
        .ok()
        .and_then(|go_mod| module_path(&go_mod));
    let report_dir = report
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(repo);
    let resolver = PathResolver::new(repo)
        .with_report_dir(report_dir)
        .with_module_prefix(module_prefix);
    let map = format.parse(&content, &resolver)?;
    print_json(&map)?;
    Ok(exit_codes::OK)
}

fn cmd_gate(config: &PipelineConfig, repo: &Path, edits_path: &Path) -> Result<i32> {
    let edits = read_edits(edits_path)?;
    let snapshot = FsScanner::new(config.scanner.clone()).scan(repo)?;
    match evaluate_gate(&edits, &snapshot.language_summary) {
        GateVerdict::Pass => {
            println!("pass");
            Ok(exit_codes::OK)
        }
        GateVerdict::Fail { reason } => {
            println!("fail: {reason}");
            Ok(exit_codes::GATE_FAILED)
        }
    }
}

fn cmd_extract_json() -> Result<i32> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("read stdin")?;
    let value = interpret(&text).into_result()?;
    print_json(&value)?;
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PipelineConfig::default())?;
    Ok(exit_codes::OK)
}

fn shell_strategy(
    repo: &Path,
    command: String,
    format: CoverageFormat,
    report: PathBuf,
) -> TestStrategy {
    let module_prefix = (format == CoverageFormat::GoProfile)
        .then(|| fs::read_to_string(repo.join("go.mod")).ok())
        .flatten()
        .and_then(|go_mod| module_path(&go_mod));
    TestStrategy {
        kind: StrategyKind::Custom,
        program: "sh".to_string(),
        args: vec!["-c".to_string(), command],
        report_path: report,
        format,
        module_prefix,
    }
}

/// Edits from a JSON file holding either an array or a draft envelope.
fn read_edits(path: &Path) -> Result<Vec<DraftEdit>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if value.is_array() {
        return serde_json::from_value(value)
            .with_context(|| format!("parse edits in {}", path.display()));
    }
    Ok(decode_draft(value)?.edits)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verify_with_custom_command() {
        let cli = Cli::parse_from([
            "pipeline",
            "verify",
            "--edits",
            "edits.json",
            "--command",
            "npm test",
            "--format",
            "lcov",
            "--report",
            "coverage/lcov.info",
        ]);
        match cli.command {
            Command::Verify {
                repo,
                command,
                format,
                ..
            } => {
                assert_eq!(repo, PathBuf::from("."));
                assert_eq!(command.as_deref(), Some("npm test"));
                assert_eq!(format, Some(CoverageFormat::Lcov));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn custom_command_requires_format_and_report() {
        let parsed = Cli::try_parse_from([
            "pipeline",
            "verify",
            "--edits",
            "e.json",
            "--command",
            "make test",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_coverage_format_aliases() {
        let cli = Cli::parse_from([
            "pipeline",
            "coverage",
            "--format",
            "go",
            "--report",
            "coverage.out",
        ]);
        assert!(matches!(
            cli.command,
            Command::Coverage {
                format: CoverageFormat::GoProfile,
                ..
            }
        ));
    }

    #[test]
    fn edits_file_accepts_array_or_envelope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let array = temp.path().join("array.json");
        fs::write(&array, r#"[{"path":"a.ts","content":"x"}]"#).expect("write");
        assert_eq!(read_edits(&array).expect("array")[0].path, "a.ts");

        let envelope = temp.path().join("envelope.json");
        fs::write(
            &envelope,
            r#"{"edits":[{"path":"b.py","content":"y","rationale":"r"}]}"#,
        )
        .expect("write");
        assert_eq!(read_edits(&envelope).expect("envelope")[0].rationale, "r");
    }

    #[test]
    fn shell_strategy_wraps_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("go.mod"), "module example.com/x\n").expect("write");
        let s = shell_strategy(
            temp.path(),
            "go test ./... -coverprofile=c.out".to_string(),
            CoverageFormat::GoProfile,
            PathBuf::from("c.out"),
        );
        assert_eq!(s.program, "sh");
        assert_eq!(s.module_prefix.as_deref(), Some("example.com/x"));
    }
}
