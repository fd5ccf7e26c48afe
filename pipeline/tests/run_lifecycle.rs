//! Run lifecycle scenarios driven through `RunService` with fake
//! collaborators: start, the unit-test gate, review, and finalize.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use pipeline::core::errors::{InvalidTransitionError, RunNotFoundError};
use pipeline::core::run::{RunInput, RunStatus};
use pipeline::core::types::{FailureCause, TestExecutionReport, TrackerKind};
use pipeline::core::unit_test_gate::CORRECTIVE_INSTRUCTION;
use pipeline::service::ReviewRequest;
use pipeline::test_support::{
    DRAFT_SOURCE_ONLY, DRAFT_WITH_TEST, FakeTracker, FakeVerifier, Fakes, PROPOSAL_JSON,
    RecordingVcs, ScriptedReasoner, TrackerBehavior,
};

fn input(repo: &Path, dry_run: bool) -> RunInput {
    RunInput {
        task_id: "PROJ-42".to_string(),
        tracker: TrackerKind::Jira,
        repo_path: repo.to_path_buf(),
        target_branch: "develop".to_string(),
        dry_run,
    }
}

fn approve(feedback: Option<&str>) -> ReviewRequest {
    ReviewRequest {
        approved: true,
        feedback: feedback.map(str::to_string),
    }
}

fn reject(feedback: &str) -> ReviewRequest {
    ReviewRequest {
        approved: false,
        feedback: Some(feedback.to_string()),
    }
}

fn staged_paths(record: &pipeline::core::run::RunRecord) -> Vec<String> {
    record
        .staged_edits
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|e| e.path.clone())
        .collect()
}

#[test]
fn start_retries_draft_until_tests_are_included() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::new([
        PROPOSAL_JSON,
        DRAFT_SOURCE_ONLY,
        DRAFT_WITH_TEST,
    ]));
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::AwaitingApproval);
    assert_eq!(record.error, None);
    assert_eq!(
        staged_paths(&record),
        vec!["src/email.ts".to_string(), "src/email.test.ts".to_string()]
    );
    assert_eq!(record.branch_name.as_deref(), Some("feature/proj-42"));
    assert!(record.test_report.as_ref().is_some_and(|r| r.success));
    assert!(
        record
            .diff_preview
            .as_deref()
            .is_some_and(|p| p.contains("=== src/email.test.ts (new file"))
    );

    let prompts = fakes.reasoner.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[1].contains(CORRECTIVE_INSTRUCTION));
    assert!(prompts[2].contains(CORRECTIVE_INSTRUCTION));
    assert_eq!(
        fakes.tracker.requests(),
        vec![(TrackerKind::Jira, "PROJ-42".to_string())]
    );
    // dry run never touches version control before approval
    assert!(fakes.vcs.calls().is_empty());
    assert_eq!(fakes.verifier.seen().len(), 1);
}

#[test]
fn start_fails_when_gate_is_never_satisfied() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::new([
        PROPOSAL_JSON,
        DRAFT_SOURCE_ONLY,
        DRAFT_SOURCE_ONLY,
    ]));
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::Failed);
    let error = record.error.as_deref().expect("error");
    assert!(error.contains("unit-test gate failed after 2 attempts"), "{error}");
    assert!(error.contains("src/email.ts"));
    assert_eq!(record.staged_edits, None);
    assert!(record.proposal.is_some());
    assert!(fakes.verifier.seen().is_empty());
}

#[test]
fn missing_tracker_credentials_fail_the_run_verbatim() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes {
        tracker: Arc::new(FakeTracker::new(TrackerBehavior::MissingCredentials(vec![
            "JIRA_BASE_URL".to_string(),
            "JIRA_API_TOKEN".to_string(),
        ]))),
        ..Fakes::new(ScriptedReasoner::new([PROPOSAL_JSON]))
    };
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("jira is not configured (missing JIRA_BASE_URL, JIRA_API_TOKEN)")
    );
    assert_eq!(record.task, None);
    assert!(fakes.reasoner.prompts().is_empty());
}

#[test]
fn tracker_transport_error_fails_the_run() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes {
        tracker: Arc::new(FakeTracker::new(TrackerBehavior::Transport(
            "404 Not Found".to_string(),
        ))),
        ..Fakes::new(ScriptedReasoner::new(Vec::<String>::new()))
    };
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("jira request failed: 404 Not Found")
    );
}

#[test]
fn reasoner_failure_stops_at_the_proposal() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::failing("reasoner", "exit status 1"));
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("reasoner request failed: exit status 1")
    );
    assert!(record.task.is_some());
    assert_eq!(record.proposal, None);
    assert_eq!(fakes.reasoner.prompts().len(), 1);
}

#[test]
fn dirty_worktree_fails_before_any_reasoning() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes {
        vcs: Arc::new(RecordingVcs::new().dirty(&[" M src/app.ts"])),
        ..Fakes::new(ScriptedReasoner::new([PROPOSAL_JSON]))
    };
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), false))
        .expect("start");

    assert_eq!(record.status, RunStatus::Failed);
    let error = record.error.as_deref().expect("error");
    assert!(error.contains("not clean"), "{error}");
    assert!(error.contains("src/app.ts"));
    assert_eq!(fakes.vcs.calls(), vec!["ensure_clean".to_string()]);
    assert!(fakes.reasoner.prompts().is_empty());
}

#[test]
fn failed_verification_gets_fast_analysis_and_still_awaits_review() {
    let repo = tempfile::tempdir().expect("tempdir");
    let mut report = TestExecutionReport::not_executed(vec!["exit status 1".to_string()]);
    report.executed = true;
    report.failure_cause = Some(FailureCause::NonZeroExit);
    report.stderr_snippet = Some("TypeError: isValidEmail is not a function".to_string());
    let fakes = Fakes {
        verifier: Arc::new(FakeVerifier::new(report)),
        ..Fakes::new(ScriptedReasoner::new([
            PROPOSAL_JSON,
            DRAFT_WITH_TEST,
            "  The helper is not exported from src/email.ts.\n",
        ]))
    };
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::AwaitingApproval);
    assert_eq!(
        record.compilation_analysis.as_deref(),
        Some("The helper is not exported from src/email.ts.")
    );
    assert_eq!(fakes.reasoner.fast_flags(), vec![false, false, true]);
    assert!(fakes.reasoner.prompts()[2].contains("isValidEmail is not a function"));
}

#[test]
fn analysis_failure_does_not_fail_the_run() {
    let repo = tempfile::tempdir().expect("tempdir");
    let mut report = TestExecutionReport::not_executed(Vec::new());
    report.executed = true;
    report.failure_cause = Some(FailureCause::TimedOut);
    let fakes = Fakes {
        verifier: Arc::new(FakeVerifier::new(report)),
        // no third response: the analysis call errors
        ..Fakes::new(ScriptedReasoner::new([PROPOSAL_JSON, DRAFT_WITH_TEST]))
    };
    let service = fakes.service().expect("service");

    let record = service
        .start_run(input(repo.path(), true))
        .expect("start");

    assert_eq!(record.status, RunStatus::AwaitingApproval);
    assert_eq!(record.compilation_analysis, None);
}

#[test]
fn dry_run_approval_writes_files_and_stops_before_commit() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::new([PROPOSAL_JSON, DRAFT_WITH_TEST]));
    let service = fakes.service().expect("service");
    let started = service
        .start_run(input(repo.path(), true))
        .expect("start");

    let done = service
        .review_run(&started.run_id, approve(None))
        .expect("review");

    assert_eq!(done.status, RunStatus::Done, "{:?}", done.error);
    let summary = done.final_summary.as_deref().expect("summary");
    assert!(summary.starts_with("Dry run: wrote 2 file(s)"), "{summary}");
    assert!(summary.contains("Nothing was committed"));
    assert_eq!(
        fs::read_to_string(repo.path().join("src/email.test.ts")).expect("read"),
        "test('ok', () => {});\n"
    );
    assert_eq!(fakes.vcs.calls(), vec!["diff".to_string()]);
    assert!(done.diff_preview.as_deref().is_some_and(|d| d.starts_with("diff --git")));
    // staged edits were reused, no extra drafting call
    assert_eq!(fakes.reasoner.prompts().len(), 2);
    assert_eq!(staged_paths(&done), staged_paths(&started));

    let records = fakes.feedback.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].approved);
    assert_eq!(records[0].run_id, started.run_id);
}

#[test]
fn approval_commits_pushes_and_publishes_in_order() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes {
        vcs: Arc::new(
            RecordingVcs::new().publishing_to("https://gitlab.example.com/team/app/-/merge_requests/7"),
        ),
        ..Fakes::new(ScriptedReasoner::new([PROPOSAL_JSON, DRAFT_WITH_TEST]))
    };
    let service = fakes.service().expect("service");
    let started = service
        .start_run(input(repo.path(), false))
        .expect("start");
    assert_eq!(started.status, RunStatus::AwaitingApproval);

    let done = service
        .review_run(&started.run_id, approve(Some("   ")))
        .expect("review");

    assert_eq!(done.status, RunStatus::Done, "{:?}", done.error);
    assert_eq!(
        fakes.vcs.calls(),
        vec![
            "ensure_clean".to_string(),
            "checkout feature/proj-42 from develop".to_string(),
            "checkout feature/proj-42 from develop".to_string(),
            "diff".to_string(),
            "commit PROJ-42: Validate email addresses at signup".to_string(),
            "push feature/proj-42".to_string(),
            "publish feature/proj-42 -> develop".to_string(),
        ]
    );
    assert_eq!(
        done.change_url.as_deref(),
        Some("https://gitlab.example.com/team/app/-/merge_requests/7")
    );
    assert_eq!(
        done.final_summary.as_deref(),
        Some(
            "Committed 0123456789 on feature/proj-42 and pushed. \
             Merge request: https://gitlab.example.com/team/app/-/merge_requests/7"
        )
    );
    // blank notes are not feedback
    assert!(done.feedback_history.is_empty());
}

#[test]
fn approval_with_feedback_redrafts_before_applying() {
    let repo = tempfile::tempdir().expect("tempdir");
    let revised = r#"{"edits":[
      {"path":"src/email.ts","content":"export const re = /.+@.+/;\n","rationale":"regex"},
      {"path":"src/email.test.ts","content":"test('re', () => {});\n","rationale":"tests"}
    ]}"#;
    let fakes = Fakes::new(ScriptedReasoner::new([
        PROPOSAL_JSON,
        DRAFT_WITH_TEST,
        revised,
    ]));
    let service = fakes.service().expect("service");
    let started = service
        .start_run(input(repo.path(), true))
        .expect("start");

    let done = service
        .review_run(&started.run_id, approve(Some("use a regex")))
        .expect("review");

    assert_eq!(done.status, RunStatus::Done, "{:?}", done.error);
    assert_eq!(done.feedback_history, vec!["use a regex".to_string()]);
    let prompts = fakes.reasoner.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[2].contains("- use a regex"));
    assert!(prompts[2].contains("### Previous Edit Set"));
    assert_eq!(
        fs::read_to_string(repo.path().join("src/email.ts")).expect("read"),
        "export const re = /.+@.+/;\n"
    );
    let staged = done.staged_edits.as_deref().expect("staged");
    assert_eq!(staged[0].rationale, "regex");
}

#[test]
fn rejection_is_terminal_and_remembered() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::new([
        PROPOSAL_JSON,
        DRAFT_WITH_TEST,
        PROPOSAL_JSON,
        DRAFT_WITH_TEST,
    ]));
    let service = fakes.service().expect("service");
    let first = service
        .start_run(input(repo.path(), true))
        .expect("start");

    let rejected = service
        .review_run(&first.run_id, reject("  touches too many files "))
        .expect("reject");
    assert_eq!(rejected.status, RunStatus::Rejected);
    assert_eq!(
        rejected.feedback_history,
        vec!["touches too many files".to_string()]
    );
    assert!(!repo.path().join("src/email.ts").exists());

    let records = fakes.feedback.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].approved);
    assert_eq!(records[0].feedback.as_deref(), Some("touches too many files"));

    let err = service
        .review_run(&first.run_id, approve(None))
        .expect_err("second review");
    let transition = err
        .downcast_ref::<InvalidTransitionError>()
        .expect("invalid transition");
    assert_eq!(transition.from, RunStatus::Rejected);
    assert_eq!(transition.to, RunStatus::Applying);

    // the next run's proposal sees the reviewer history
    service
        .start_run(input(repo.path(), true))
        .expect("second start");
    let prompts = fakes.reasoner.prompts();
    assert!(prompts[2].contains("### Reviewer History"));
    assert!(prompts[2].contains("touches too many files"));
}

#[test]
fn failed_runs_cannot_be_reviewed() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::failing("reasoner", "down"));
    let service = fakes.service().expect("service");
    let failed = service
        .start_run(input(repo.path(), true))
        .expect("start");

    let err = service
        .review_run(&failed.run_id, reject("no"))
        .expect_err("review of failed run");
    assert!(err.downcast_ref::<InvalidTransitionError>().is_some());
    assert!(fakes.feedback.records().is_empty());
}

#[test]
fn unknown_run_is_not_found() {
    let fakes = Fakes::new(ScriptedReasoner::new(Vec::<String>::new()));
    let service = fakes.service().expect("service");

    let err = service
        .review_run("run-missing", approve(None))
        .expect_err("missing run");
    assert_eq!(
        err.downcast_ref::<RunNotFoundError>()
            .map(|e| e.run_id.as_str()),
        Some("run-missing")
    );
    assert!(service.get_run("run-missing").is_err());
}

#[test]
fn blank_target_branch_uses_default_and_runs_are_listed() {
    let repo = tempfile::tempdir().expect("tempdir");
    let fakes = Fakes::new(ScriptedReasoner::new([
        PROPOSAL_JSON,
        DRAFT_WITH_TEST,
        PROPOSAL_JSON,
        DRAFT_WITH_TEST,
    ]));
    let service = fakes.service().expect("service");
    let mut blank = input(repo.path(), true);
    blank.target_branch = "  ".to_string();

    let first = service.start_run(blank).expect("first");
    let second = service
        .start_run(input(repo.path(), true))
        .expect("second");

    assert_eq!(first.input.target_branch, "develop");
    let listed: Vec<String> = service
        .list_runs()
        .expect("list")
        .into_iter()
        .map(|r| r.run_id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&first.run_id));
    assert!(listed.contains(&second.run_id));
    assert_eq!(
        service.get_run(&second.run_id).expect("get").status,
        RunStatus::AwaitingApproval
    );
}
