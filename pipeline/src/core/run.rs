//! Run record and its legal status transitions.
//!
//! ```text
//! awaiting_approval --approve--> applying --ok--> done
//!        |                          \--err--> failed
//!        \--reject--> rejected
//! ```
//!
//! A run that fails before the human gate is created directly as `failed`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::InvalidTransitionError;
use crate::core::types::{
    DesignProposal, DraftEdit, RepoSnapshot, TaskDetails, TestExecutionReport, TrackerKind,
};

pub const DEFAULT_TARGET_BRANCH: &str = "develop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    AwaitingApproval,
    Applying,
    Done,
    Rejected,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Applying => "applying",
            RunStatus::Done => "done",
            RunStatus::Rejected => "rejected",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Rejected | RunStatus::Failed
        )
    }

    fn allows(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::AwaitingApproval, RunStatus::Applying)
                | (RunStatus::AwaitingApproval, RunStatus::Rejected)
                | (RunStatus::AwaitingApproval, RunStatus::Failed)
                | (RunStatus::Applying, RunStatus::Done)
                | (RunStatus::Applying, RunStatus::Failed)
        )
    }
}

/// Check that `from -> to` is a legal move for `run_id`.
pub fn validate_transition(
    run_id: &str,
    from: RunStatus,
    to: RunStatus,
) -> Result<(), InvalidTransitionError> {
    if from.allows(to) {
        return Ok(());
    }
    Err(InvalidTransitionError {
        run_id: run_id.to_string(),
        from,
        to,
    })
}

fn default_target_branch() -> String {
    DEFAULT_TARGET_BRANCH.to_string()
}

fn default_dry_run() -> bool {
    true
}

/// Parameters of a start-run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    pub task_id: String,
    pub tracker: TrackerKind,
    pub repo_path: PathBuf,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

/// Per-run record owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub input: RunInput,
    pub status: RunStatus,
    pub task: Option<TaskDetails>,
    pub repo_snapshot: Option<RepoSnapshot>,
    pub proposal: Option<DesignProposal>,
    pub staged_edits: Option<Vec<DraftEdit>>,
    pub branch_name: Option<String>,
    pub diff_preview: Option<String>,
    pub test_report: Option<TestExecutionReport>,
    pub compilation_analysis: Option<String>,
    pub feedback_history: Vec<String>,
    pub final_summary: Option<String>,
    pub change_url: Option<String>,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(
        run_id: String,
        created_at: DateTime<Utc>,
        input: RunInput,
        status: RunStatus,
    ) -> Self {
        Self {
            run_id,
            created_at,
            input,
            status,
            task: None,
            repo_snapshot: None,
            proposal: None,
            staged_edits: None,
            branch_name: None,
            diff_preview: None,
            test_report: None,
            compilation_analysis: None,
            feedback_history: Vec::new(),
            final_summary: None,
            change_url: None,
            error: None,
        }
    }

    /// Merge `patch` into the record, replacing each field the patch sets.
    pub fn apply(&mut self, patch: RunPatch) {
        let RunPatch {
            status,
            task,
            repo_snapshot,
            proposal,
            staged_edits,
            branch_name,
            diff_preview,
            test_report,
            compilation_analysis,
            feedback_history,
            final_summary,
            change_url,
            error,
        } = patch;
        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = task {
            self.task = Some(v);
        }
        if let Some(v) = repo_snapshot {
            self.repo_snapshot = Some(v);
        }
        if let Some(v) = proposal {
            self.proposal = Some(v);
        }
        if let Some(v) = staged_edits {
            self.staged_edits = Some(v);
        }
        if let Some(v) = branch_name {
            self.branch_name = Some(v);
        }
        if let Some(v) = diff_preview {
            self.diff_preview = Some(v);
        }
        if let Some(v) = test_report {
            self.test_report = Some(v);
        }
        if let Some(v) = compilation_analysis {
            self.compilation_analysis = Some(v);
        }
        if let Some(v) = feedback_history {
            self.feedback_history = v;
        }
        if let Some(v) = final_summary {
            self.final_summary = Some(v);
        }
        if let Some(v) = change_url {
            self.change_url = Some(v);
        }
        if let Some(v) = error {
            self.error = Some(v);
        }
    }
}

/// Whole-field update for a [`RunRecord`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub task: Option<TaskDetails>,
    pub repo_snapshot: Option<RepoSnapshot>,
    pub proposal: Option<DesignProposal>,
    pub staged_edits: Option<Vec<DraftEdit>>,
    pub branch_name: Option<String>,
    pub diff_preview: Option<String>,
    pub test_report: Option<TestExecutionReport>,
    pub compilation_analysis: Option<String>,
    pub feedback_history: Option<Vec<String>>,
    pub final_summary: Option<String>,
    pub change_url: Option<String>,
    pub error: Option<String>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RunInput {
        RunInput {
            task_id: "PROJ-1".to_string(),
            tracker: TrackerKind::Jira,
            repo_path: PathBuf::from("/repo"),
            target_branch: DEFAULT_TARGET_BRANCH.to_string(),
            dry_run: true,
        }
    }

    #[test]
    fn approval_moves_only_from_awaiting_approval() {
        assert!(validate_transition("r", RunStatus::AwaitingApproval, RunStatus::Applying).is_ok());
        assert!(validate_transition("r", RunStatus::AwaitingApproval, RunStatus::Rejected).is_ok());
        assert!(validate_transition("r", RunStatus::Applying, RunStatus::Done).is_ok());
        assert!(validate_transition("r", RunStatus::Applying, RunStatus::Failed).is_ok());

        let err = validate_transition("r", RunStatus::Done, RunStatus::Applying).unwrap_err();
        assert_eq!(err.from, RunStatus::Done);
        assert_eq!(err.to, RunStatus::Applying);
        assert!(validate_transition("r", RunStatus::Rejected, RunStatus::Applying).is_err());
        assert!(validate_transition("r", RunStatus::Failed, RunStatus::Rejected).is_err());
        assert!(validate_transition("r", RunStatus::Applying, RunStatus::Rejected).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Rejected.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::AwaitingApproval.is_terminal());
        assert!(!RunStatus::Applying.is_terminal());
    }

    #[test]
    fn patch_replaces_only_set_fields() {
        let mut record = RunRecord::new(
            "run-1".to_string(),
            Utc::now(),
            input(),
            RunStatus::AwaitingApproval,
        );
        record.branch_name = Some("feature/proj-1".to_string());
        record.feedback_history = vec!["first".to_string()];

        record.apply(RunPatch {
            feedback_history: Some(vec!["first".to_string(), "second".to_string()]),
            ..RunPatch::status(RunStatus::Rejected)
        });

        assert_eq!(record.status, RunStatus::Rejected);
        assert_eq!(record.branch_name.as_deref(), Some("feature/proj-1"));
        assert_eq!(record.feedback_history, vec!["first", "second"]);
    }

    #[test]
    fn input_defaults_to_develop_dry_run() {
        let input: RunInput = serde_json::from_str(
            r#"{"taskId":"PROJ-1","tracker":"gitlab","repoPath":"/repo"}"#,
        )
        .expect("parse");
        assert_eq!(input.target_branch, "develop");
        assert!(input.dry_run);
        assert_eq!(input.tracker, TrackerKind::Gitlab);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::AwaitingApproval).expect("serialize");
        assert_eq!(json, "\"awaiting_approval\"");
    }
}
