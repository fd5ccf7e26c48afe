//! Start sequence: everything a run does before the human gate.

use tracing::{info, instrument, warn};

use crate::core::response::interpret;
use crate::core::run::{RunInput, RunPatch, RunStatus};
use crate::core::schema::decode_proposal;
use crate::core::types::{
    DesignProposal, DraftEdit, RepoSnapshot, TaskDetails, TestExecutionReport,
};
use crate::drafting::{DraftRequest, draft_edits};
use crate::io::prompt::ProposalInputs;
use crate::orchestrator::{Pipeline, render_edit_preview};
use crate::stages::{Flow, Stage, require, run_stages};

/// What the start stages accumulate.
#[derive(Debug, Clone, Default)]
pub struct StartState {
    pub input: Option<RunInput>,
    pub task: Option<TaskDetails>,
    pub snapshot: Option<RepoSnapshot>,
    pub bias: String,
    pub branch: Option<String>,
    pub proposal: Option<DesignProposal>,
    pub edits: Option<Vec<DraftEdit>>,
    pub report: Option<TestExecutionReport>,
    pub analysis: Option<String>,
    pub diff_preview: Option<String>,
}

impl StartState {
    fn new(input: RunInput) -> Self {
        Self {
            input: Some(input),
            ..Self::default()
        }
    }

    fn into_patch(self) -> RunPatch {
        RunPatch {
            task: self.task,
            repo_snapshot: self.snapshot,
            proposal: self.proposal,
            staged_edits: self.edits,
            branch_name: self.branch,
            diff_preview: self.diff_preview,
            test_report: self.report,
            compilation_analysis: self.analysis,
            ..RunPatch::default()
        }
    }
}

const START_STAGES: &[Stage<Pipeline, StartState>] = &[
    Stage {
        name: "gather_task",
        run: gather_task,
    },
    Stage {
        name: "scan_repository",
        run: scan_repository,
    },
    Stage {
        name: "load_feedback_bias",
        run: load_feedback_bias,
    },
    Stage {
        name: "prepare_branch",
        run: prepare_branch,
    },
    Stage {
        name: "request_proposal",
        run: request_proposal,
    },
    Stage {
        name: "draft_edits",
        run: draft_stage,
    },
    Stage {
        name: "verify_edits",
        run: verify_edits,
    },
];

impl Pipeline {
    /// Run the start sequence for `input`.
    ///
    /// The returned patch carries everything gathered so far and either
    /// `awaiting_approval` or `failed` with the stage error's message.
    #[instrument(
        skip_all,
        fields(task = %input.task_id, repo = %input.repo_path.display(), dry_run = input.dry_run)
    )]
    pub fn start(&self, input: &RunInput) -> RunPatch {
        let mut state = StartState::new(input.clone());
        let outcome = run_stages(self, START_STAGES, &mut state);
        let mut patch = state.into_patch();
        match outcome {
            Ok(()) => {
                info!("run awaiting approval");
                patch.status = Some(RunStatus::AwaitingApproval);
            }
            Err((stage, err)) => {
                warn!(stage, "run failed before approval");
                patch.status = Some(RunStatus::Failed);
                patch.error = Some(format!("{err:#}"));
            }
        }
        patch
    }
}

fn gather_task(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    let task = p
        .collaborators
        .tracker
        .fetch_task(input.tracker, &input.task_id)?;
    info!(task = %task.id, title = %task.title, "task fetched");
    s.task = Some(task);
    Ok(Flow::Continue)
}

fn scan_repository(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    s.snapshot = Some(p.collaborators.scanner.scan(&input.repo_path)?);
    Ok(Flow::Continue)
}

fn load_feedback_bias(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    s.bias = p.collaborators.feedback.summarize_bias(&input.repo_path)?;
    Ok(Flow::Continue)
}

fn prepare_branch(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    let vcs = &p.collaborators.vcs;
    let branch = vcs.build_branch_name(&input.task_id);
    if !input.dry_run {
        vcs.ensure_clean(&input.repo_path)?;
        vcs.create_or_checkout_branch(&input.repo_path, &branch, &input.target_branch)?;
        info!(%branch, base = %input.target_branch, "branch ready");
    }
    s.branch = Some(branch);
    Ok(Flow::Continue)
}

fn request_proposal(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    let prompt = p.prompts.proposal(ProposalInputs {
        task: require(&s.task, "task")?,
        snapshot: require(&s.snapshot, "repository snapshot")?,
        bias: &s.bias,
        target_branch: &input.target_branch,
    })?;
    let text = p.collaborators.reasoner.generate_text(&prompt, false)?;
    let value = interpret(&text).into_result()?;
    let proposal = decode_proposal(value)?;
    info!(
        planned_edits = proposal.proposed_edits.len(),
        "proposal received"
    );
    s.proposal = Some(proposal);
    Ok(Flow::Continue)
}

fn draft_stage(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let edits = draft_edits(
        p.collaborators.reasoner.as_ref(),
        &p.prompts,
        DraftRequest {
            task: require(&s.task, "task")?,
            snapshot: require(&s.snapshot, "repository snapshot")?,
            proposal: require(&s.proposal, "proposal")?,
            feedback: &[],
            previous_paths: &[],
            max_attempts: p.max_draft_attempts,
        },
    )?;
    s.edits = Some(edits);
    Ok(Flow::Continue)
}

fn verify_edits(p: &Pipeline, s: &mut StartState) -> anyhow::Result<Flow> {
    let input = require(&s.input, "run input")?;
    let repo = &input.repo_path;
    let edits = require(&s.edits, "staged edits")?;
    let report = p
        .collaborators
        .verifier
        .verify(repo, require(&s.snapshot, "repository snapshot")?, edits)?;

    if report.failure_cause.is_some() {
        let paths: Vec<String> = edits.iter().map(|e| e.path.clone()).collect();
        s.analysis = failure_analysis(p, &report, &paths);
    }
    s.diff_preview = Some(render_edit_preview(repo, edits));
    s.report = Some(report);
    Ok(Flow::Continue)
}

/// Short explanation of a failed verification from the fast model. Best
/// effort: the report already records the failure.
fn failure_analysis(
    p: &Pipeline,
    report: &TestExecutionReport,
    paths: &[String],
) -> Option<String> {
    let analysis = p
        .prompts
        .failure_analysis(report, paths)
        .and_then(|prompt| p.collaborators.reasoner.generate_text(&prompt, true));
    match analysis {
        Ok(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failure analysis unavailable");
            None
        }
    }
}
