//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between the orchestrator, the
//! verification engine and the HTTP surface. Field names serialize in
//! camelCase because run records are served to the review form as-is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Issue tracker a task id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    Jira,
    Gitlab,
}

impl TrackerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerKind::Jira => "jira",
            TrackerKind::Gitlab => "gitlab",
        }
    }
}

/// Ticket data as returned by the tracker client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Bounded description of the target repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSnapshot {
    pub file_count: usize,
    pub top_level_entries: Vec<String>,
    /// Language name -> number of files.
    pub language_summary: BTreeMap<String, usize>,
    pub sample_files: Vec<String>,
    pub tech_stack: Vec<String>,
    pub testing_guidance: String,
}

/// One file the proposal intends to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEdit {
    pub path: String,
    #[serde(default)]
    pub summary: String,
}

/// Implementation proposal produced once per run by the reasoning service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DesignProposal {
    pub requirements: Vec<String>,
    pub assumptions: Vec<String>,
    pub implementation_plan: Vec<String>,
    pub test_plan: Vec<String>,
    pub proposed_edits: Vec<ProposedEdit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
}

/// A complete replacement file body plus justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftEdit {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub rationale: String,
}

/// Why a verification attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The command ran to completion and exited unsuccessfully.
    NonZeroExit,
    /// The command exceeded the wall-clock budget and was killed.
    TimedOut,
    /// The command produced more output than allowed and was killed.
    OutputLimitExceeded,
    /// The command could not be started (or the engine failed around it).
    SpawnFailed,
}

/// Line coverage for one edited file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    pub path: String,
    pub covered_lines: u64,
    pub total_lines: u64,
    pub line_coverage_percent: Option<f64>,
}

/// Result of one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecutionReport {
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<FailureCause>,
    pub overall_line_coverage_percent: Option<f64>,
    pub file_coverage: Vec<FileCoverage>,
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_snippet: Option<String>,
}

impl TestExecutionReport {
    /// Report for a repository where no test strategy applies.
    pub fn not_executed(notes: Vec<String>) -> Self {
        Self {
            executed: false,
            success: false,
            command: None,
            failure_cause: None,
            overall_line_coverage_percent: None,
            file_coverage: Vec::new(),
            notes,
            stdout_snippet: None,
            stderr_snippet: None,
        }
    }
}

/// Covered and total line counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageAggregate {
    pub covered_lines: u64,
    pub total_lines: u64,
}

impl CoverageAggregate {
    pub fn add(&mut self, other: CoverageAggregate) {
        self.covered_lines += other.covered_lines;
        self.total_lines += other.total_lines;
    }
}

/// Aggregates keyed by normalized repository-relative path.
pub type CoverageMap = BTreeMap<String, CoverageAggregate>;

/// `round(100 * covered / total, 2)`, or `None` when `total` is zero.
pub fn coverage_percent(covered: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let raw = covered as f64 * 100.0 / total as f64;
    Some((raw * 100.0).round() / 100.0)
}
