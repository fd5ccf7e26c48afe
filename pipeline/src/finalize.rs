//! Finalize sequence: what an approved run does to the repository.

use tracing::{info, instrument, warn};

use crate::core::run::{RunPatch, RunRecord, RunStatus};
use crate::core::types::{DesignProposal, DraftEdit, TaskDetails, TestExecutionReport};
use crate::core::unit_test_gate::evaluate_gate;
use crate::drafting::{DraftRequest, draft_edits};
use crate::io::edits::apply_edits;
use crate::io::git::ChangeRequest;
use crate::orchestrator::Pipeline;
use crate::stages::{Flow, Stage, require, run_stages};

const SHORT_SHA: usize = 10;

/// What the finalize stages accumulate on top of the approved record.
#[derive(Debug, Clone)]
pub struct FinalizeState {
    pub record: RunRecord,
    /// The reviewer note given with this approval, if any.
    pub note: Option<String>,
    pub edits: Option<Vec<DraftEdit>>,
    pub redrafted: bool,
    pub diff: Option<String>,
    pub commit_sha: Option<String>,
    pub change_url: Option<String>,
    pub summary: Option<String>,
}

impl FinalizeState {
    fn new(record: RunRecord, note: Option<String>) -> Self {
        Self {
            record,
            note,
            edits: None,
            redrafted: false,
            diff: None,
            commit_sha: None,
            change_url: None,
            summary: None,
        }
    }

    fn into_patch(self) -> RunPatch {
        RunPatch {
            staged_edits: if self.redrafted { self.edits } else { None },
            diff_preview: self.diff,
            final_summary: self.summary,
            change_url: self.change_url,
            ..RunPatch::default()
        }
    }
}

const FINALIZE_STAGES: &[Stage<Pipeline, FinalizeState>] = &[
    Stage {
        name: "resolve_edits",
        run: resolve_edits,
    },
    Stage {
        name: "checkout_branch",
        run: checkout_branch,
    },
    Stage {
        name: "apply_edits",
        run: apply_stage,
    },
    Stage {
        name: "compute_diff",
        run: compute_diff,
    },
    Stage {
        name: "dry_run_stop",
        run: dry_run_stop,
    },
    Stage {
        name: "commit",
        run: commit,
    },
    Stage {
        name: "push",
        run: push,
    },
    Stage {
        name: "publish",
        run: publish,
    },
    Stage {
        name: "summarize",
        run: summarize,
    },
];

impl Pipeline {
    /// Run the finalize sequence for an approved (`applying`) record.
    ///
    /// `note` is the reviewer feedback given with the approval; the record's
    /// feedback history must already include it.
    #[instrument(skip_all, fields(run_id = %record.run_id, dry_run = record.input.dry_run))]
    pub fn finalize(&self, record: &RunRecord, note: Option<&str>) -> RunPatch {
        let mut state = FinalizeState::new(record.clone(), note.map(str::to_string));
        let outcome = run_stages(self, FINALIZE_STAGES, &mut state);
        let mut patch = state.into_patch();
        match outcome {
            Ok(()) => {
                info!("run finalized");
                patch.status = Some(RunStatus::Done);
            }
            Err((stage, err)) => {
                warn!(stage, "finalize failed");
                patch.status = Some(RunStatus::Failed);
                patch.error = Some(format!("{err:#}"));
            }
        }
        patch
    }
}

fn resolve_edits(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let record = &s.record;
    let snapshot = require(&record.repo_snapshot, "repository snapshot")?;
    let staged = record.staged_edits.as_deref().unwrap_or_default();
    let reusable = !staged.is_empty()
        && evaluate_gate(staged, &snapshot.language_summary).passed();
    if s.note.is_none() && reusable {
        info!(edits = staged.len(), "reusing staged edits");
        s.edits = Some(staged.to_vec());
        return Ok(Flow::Continue);
    }

    info!(
        feedback = record.feedback_history.len(),
        "re-drafting with reviewer feedback"
    );
    let previous: Vec<String> = staged.iter().map(|e| e.path.clone()).collect();
    let edits = draft_edits(
        p.collaborators.reasoner.as_ref(),
        &p.prompts,
        DraftRequest {
            task: require(&record.task, "task")?,
            snapshot,
            proposal: require(&record.proposal, "proposal")?,
            feedback: &record.feedback_history,
            previous_paths: &previous,
            max_attempts: p.max_draft_attempts,
        },
    )?;
    s.edits = Some(edits);
    s.redrafted = true;
    Ok(Flow::Continue)
}

fn checkout_branch(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let input = &s.record.input;
    if !input.dry_run {
        let branch = require(&s.record.branch_name, "branch name")?;
        p.collaborators
            .vcs
            .create_or_checkout_branch(&input.repo_path, branch, &input.target_branch)?;
    }
    Ok(Flow::Continue)
}

fn apply_stage(_: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let edits = require(&s.edits, "edits")?;
    apply_edits(&s.record.input.repo_path, edits)?;
    info!(files = edits.len(), "edits written");
    Ok(Flow::Continue)
}

fn compute_diff(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    s.diff = Some(p.collaborators.vcs.diff(&s.record.input.repo_path)?);
    Ok(Flow::Continue)
}

fn dry_run_stop(_: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    if !s.record.input.dry_run {
        return Ok(Flow::Continue);
    }
    let files = s.edits.as_ref().map_or(0, Vec::len);
    s.summary = Some(format!(
        "Dry run: wrote {files} file(s) to {}. Nothing was committed, pushed or published.",
        s.record.input.repo_path.display()
    ));
    Ok(Flow::Stop)
}

fn commit(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let task = require(&s.record.task, "task")?;
    let message = commit_message(task, s.record.proposal.as_ref());
    let sha = p
        .collaborators
        .vcs
        .stage_commit_and_get_sha(&s.record.input.repo_path, &message)?;
    info!(%sha, "committed");
    s.commit_sha = Some(sha);
    Ok(Flow::Continue)
}

fn push(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let branch = require(&s.record.branch_name, "branch name")?;
    p.collaborators
        .vcs
        .push_branch(&s.record.input.repo_path, branch)?;
    Ok(Flow::Continue)
}

fn publish(p: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let task = require(&s.record.task, "task")?;
    let request = ChangeRequest {
        source_branch: require(&s.record.branch_name, "branch name")?.clone(),
        target_branch: s.record.input.target_branch.clone(),
        title: change_title(task, s.record.proposal.as_ref()),
        description: change_description(
            task,
            s.record.proposal.as_ref(),
            s.record.test_report.as_ref(),
        ),
    };
    s.change_url = p
        .collaborators
        .vcs
        .publish_change(&s.record.input.repo_path, &request)?;
    Ok(Flow::Continue)
}

fn summarize(_: &Pipeline, s: &mut FinalizeState) -> anyhow::Result<Flow> {
    let sha = require(&s.commit_sha, "commit sha")?;
    let branch = require(&s.record.branch_name, "branch name")?;
    let short = short_sha(sha);
    let mut summary = format!("Committed {short} on {branch} and pushed.");
    match &s.change_url {
        Some(url) => summary.push_str(&format!(" Merge request: {url}")),
        None => summary.push_str(" No merge request was opened."),
    }
    s.summary = Some(summary);
    Ok(Flow::Continue)
}

/// Leading characters of a commit id, never splitting a character.
fn short_sha(sha: &str) -> String {
    sha.chars().take(SHORT_SHA).collect()
}

fn with_task_id(task: &TaskDetails, title: &str) -> String {
    if title.contains(&task.id) {
        title.to_string()
    } else {
        format!("{}: {title}", task.id)
    }
}

pub fn commit_message(task: &TaskDetails, proposal: Option<&DesignProposal>) -> String {
    let title = proposal
        .and_then(|p| p.commit_title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(&task.title);
    with_task_id(task, title)
}

fn change_title(task: &TaskDetails, proposal: Option<&DesignProposal>) -> String {
    match proposal
        .and_then(|p| p.pr_title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        Some(title) => with_task_id(task, title),
        None => commit_message(task, proposal),
    }
}

fn change_description(
    task: &TaskDetails,
    proposal: Option<&DesignProposal>,
    report: Option<&TestExecutionReport>,
) -> String {
    let mut out = format!("Resolves {}", task.id);
    if let Some(url) = &task.url {
        out.push_str(&format!(" ({url})"));
    }
    out.push('\n');
    if let Some(proposal) = proposal
        && !proposal.requirements.is_empty()
    {
        out.push_str("\n## Requirements\n");
        for requirement in &proposal.requirements {
            out.push_str(&format!("- {requirement}\n"));
        }
    }
    if let Some(report) = report {
        out.push_str("\n## Verification\n");
        let outcome = match (report.executed, report.success) {
            (false, _) => "not executed",
            (true, true) => "passed",
            (true, false) => "failed",
        };
        out.push_str(&format!("- tests: {outcome}\n"));
        if let Some(percent) = report.overall_line_coverage_percent {
            out.push_str(&format!("- line coverage of edited files: {percent:.2}%\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskDetails {
        TaskDetails {
            id: "PROJ-9".to_string(),
            title: "Trim usernames".to_string(),
            description: String::new(),
            labels: Vec::new(),
            priority: None,
            url: Some("https://jira.example.com/browse/PROJ-9".to_string()),
        }
    }

    #[test]
    fn commit_message_falls_back_to_task_title() {
        assert_eq!(commit_message(&task(), None), "PROJ-9: Trim usernames");
        let proposal = DesignProposal {
            commit_title: Some("PROJ-9 trim input".to_string()),
            ..DesignProposal::default()
        };
        assert_eq!(commit_message(&task(), Some(&proposal)), "PROJ-9 trim input");
    }

    #[test]
    fn change_title_prefers_pr_title() {
        let proposal = DesignProposal {
            commit_title: Some("trim input".to_string()),
            pr_title: Some("Trim usernames on signup".to_string()),
            ..DesignProposal::default()
        };
        assert_eq!(
            change_title(&task(), Some(&proposal)),
            "PROJ-9: Trim usernames on signup"
        );
        assert_eq!(change_title(&task(), None), "PROJ-9: Trim usernames");
    }

    #[test]
    fn description_lists_requirements_and_coverage() {
        let proposal = DesignProposal {
            requirements: vec!["strip whitespace".to_string()],
            ..DesignProposal::default()
        };
        let mut report = TestExecutionReport::not_executed(Vec::new());
        report.executed = true;
        report.success = true;
        report.overall_line_coverage_percent = Some(87.5);
        let text = change_description(&task(), Some(&proposal), Some(&report));
        assert!(text.starts_with("Resolves PROJ-9 (https://jira.example.com/browse/PROJ-9)"));
        assert!(text.contains("- strip whitespace"));
        assert!(text.contains("- tests: passed"));
        assert!(text.contains("87.50%"));
    }

    #[test]
    fn short_sha_counts_characters() {
        assert_eq!(short_sha("0123456789abcdef"), "0123456789");
        assert_eq!(short_sha("abc"), "abc");
        assert_eq!(short_sha("ünïcødé-çømmït-íd"), "ünïcødé-çø");
    }
}
