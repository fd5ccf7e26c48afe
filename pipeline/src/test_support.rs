//! Test-only fakes for every collaborator, plus small fixture builders.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::core::errors::{ConfigurationError, TransportError, WorktreeStateError};
use crate::core::types::{
    DraftEdit, RepoSnapshot, TaskDetails, TestExecutionReport, TrackerKind,
};
use crate::io::config::PipelineConfig;
use crate::io::feedback::{FeedbackMemory, FeedbackRecord, summarize};
use crate::io::git::{ChangeRequest, VersionControl, slugify};
use crate::io::reasoner::Reasoner;
use crate::io::run_store::InMemoryRunStore;
use crate::io::scanner::RepoScanner;
use crate::io::tracker::TaskTracker;
use crate::io::verification::TestVerifier;
use crate::orchestrator::{Collaborators, Pipeline};
use crate::service::RunService;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Task fixture with a stable id and title.
pub fn task(id: &str) -> TaskDetails {
    TaskDetails {
        id: id.to_string(),
        title: "Validate email addresses".to_string(),
        description: "Reject malformed addresses at signup.".to_string(),
        labels: vec!["backend".to_string()],
        priority: Some("High".to_string()),
        url: Some(format!("https://tracker.example.com/browse/{id}")),
    }
}

/// Snapshot of a TypeScript repository (tests required).
pub fn ts_snapshot() -> RepoSnapshot {
    RepoSnapshot {
        file_count: 24,
        top_level_entries: vec!["package.json".to_string(), "src/".to_string()],
        language_summary: BTreeMap::from([("TypeScript".to_string(), 20)]),
        sample_files: vec!["src/signup.ts".to_string()],
        tech_stack: vec!["Node.js".to_string(), "Jest".to_string()],
        testing_guidance: "Write Jest tests as `<name>.test.ts`.".to_string(),
    }
}

pub fn edit(path: &str, content: &str) -> DraftEdit {
    DraftEdit {
        path: path.to_string(),
        content: content.to_string(),
        rationale: String::new(),
    }
}

/// Proposal response the interpreter and schema accept.
pub const PROPOSAL_JSON: &str = r#"```json
{
  "requirements": ["reject malformed email addresses"],
  "assumptions": [],
  "implementationPlan": ["add an isValidEmail helper", "call it from signup"],
  "testPlan": ["unit test valid and invalid addresses"],
  "proposedEdits": [{"path": "src/email.ts", "summary": "validator"}],
  "commitTitle": "Validate email addresses at signup"
}
```"#;

/// Draft touching a source file only.
pub const DRAFT_SOURCE_ONLY: &str =
    r#"{"edits":[{"path":"src/email.ts","content":"export const ok = true;\n","rationale":"validator"}]}"#;

/// Draft with a source file and its test.
pub const DRAFT_WITH_TEST: &str = r#"{"edits":[
  {"path":"src/email.ts","content":"export const ok = true;\n","rationale":"validator"},
  {"path":"src/email.test.ts","content":"test('ok', () => {});\n","rationale":"coverage"}
]}"#;

/// Reasoner answering from a fixed script, one response per call.
#[derive(Default)]
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
    failure: Option<(String, String)>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl ScriptedReasoner {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Reasoner whose every call fails with a [`TransportError`].
    pub fn failing(service: &str, message: &str) -> Self {
        Self {
            failure: Some((service.to_string(), message.to_string())),
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        locked(&self.calls).iter().map(|(p, _)| p.clone()).collect()
    }

    /// `fast` flag of every call, in order.
    pub fn fast_flags(&self) -> Vec<bool> {
        locked(&self.calls).iter().map(|(_, fast)| *fast).collect()
    }

    pub fn remaining(&self) -> usize {
        locked(&self.responses).len()
    }
}

impl Reasoner for ScriptedReasoner {
    fn generate_text(&self, prompt: &str, fast: bool) -> Result<String> {
        locked(&self.calls).push((prompt.to_string(), fast));
        if let Some((service, message)) = &self.failure {
            return Err(TransportError {
                service: service.clone(),
                message: message.clone(),
            }
            .into());
        }
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted reasoner has no response left"))
    }
}

/// What a [`FakeTracker`] does when asked for a task.
#[derive(Debug, Clone)]
pub enum TrackerBehavior {
    Task(TaskDetails),
    Transport(String),
    MissingCredentials(Vec<String>),
}

pub struct FakeTracker {
    behavior: TrackerBehavior,
    requests: Mutex<Vec<(TrackerKind, String)>>,
}

impl FakeTracker {
    pub fn new(behavior: TrackerBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(TrackerKind, String)> {
        locked(&self.requests).clone()
    }
}

impl TaskTracker for FakeTracker {
    fn fetch_task(&self, kind: TrackerKind, task_id: &str) -> Result<TaskDetails> {
        locked(&self.requests).push((kind, task_id.to_string()));
        match &self.behavior {
            TrackerBehavior::Task(task) => Ok(task.clone()),
            TrackerBehavior::Transport(message) => Err(TransportError {
                service: kind.as_str().to_string(),
                message: message.clone(),
            }
            .into()),
            TrackerBehavior::MissingCredentials(missing) => Err(ConfigurationError {
                service: kind.as_str().to_string(),
                missing: missing.clone(),
            }
            .into()),
        }
    }
}

pub struct FakeScanner {
    pub snapshot: RepoSnapshot,
}

impl RepoScanner for FakeScanner {
    fn scan(&self, _repo: &Path) -> Result<RepoSnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// Version control that records calls instead of running git.
pub struct RecordingVcs {
    dirty: Vec<String>,
    change_url: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingVcs {
    pub fn new() -> Self {
        Self {
            dirty: Vec::new(),
            change_url: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Report these porcelain entries from `ensure_clean`.
    pub fn dirty(mut self, entries: &[&str]) -> Self {
        self.dirty = entries.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn publishing_to(mut self, url: &str) -> Self {
        self.change_url = Some(url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }
}

impl Default for RecordingVcs {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionControl for RecordingVcs {
    fn build_branch_name(&self, task_id: &str) -> String {
        format!("feature/{}", slugify(task_id))
    }

    fn ensure_clean(&self, repo: &Path) -> Result<()> {
        self.record("ensure_clean".to_string());
        if self.dirty.is_empty() {
            return Ok(());
        }
        Err(WorktreeStateError {
            repo_path: repo.display().to_string(),
            entries: self.dirty.clone(),
        }
        .into())
    }

    fn create_or_checkout_branch(&self, _repo: &Path, branch: &str, base: &str) -> Result<()> {
        self.record(format!("checkout {branch} from {base}"));
        Ok(())
    }

    fn diff(&self, _repo: &Path) -> Result<String> {
        self.record("diff".to_string());
        Ok("diff --git a/src/email.ts b/src/email.ts\n".to_string())
    }

    fn stage_commit_and_get_sha(&self, _repo: &Path, message: &str) -> Result<String> {
        self.record(format!("commit {message}"));
        Ok("0123456789abcdef0123456789abcdef01234567".to_string())
    }

    fn push_branch(&self, _repo: &Path, branch: &str) -> Result<()> {
        self.record(format!("push {branch}"));
        Ok(())
    }

    fn publish_change(&self, _repo: &Path, request: &ChangeRequest) -> Result<Option<String>> {
        self.record(format!(
            "publish {} -> {}",
            request.source_branch, request.target_branch
        ));
        Ok(self.change_url.clone())
    }
}

/// Feedback memory kept in memory, with a fixed bias text.
#[derive(Default)]
pub struct InMemoryFeedback {
    records: Mutex<Vec<FeedbackRecord>>,
}

impl InMemoryFeedback {
    pub fn records(&self) -> Vec<FeedbackRecord> {
        locked(&self.records).clone()
    }
}

impl FeedbackMemory for InMemoryFeedback {
    fn append_feedback(&self, _repo: &Path, record: FeedbackRecord) -> Result<()> {
        locked(&self.records).push(record);
        Ok(())
    }

    fn summarize_bias(&self, _repo: &Path) -> Result<String> {
        Ok(summarize(&locked(&self.records)))
    }
}

/// Verifier returning a canned report and remembering what it was given.
pub struct FakeVerifier {
    report: TestExecutionReport,
    seen: Mutex<Vec<Vec<DraftEdit>>>,
}

impl FakeVerifier {
    pub fn new(report: TestExecutionReport) -> Self {
        Self {
            report,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Report of a passing run with 80% coverage.
    pub fn passing() -> Self {
        let mut report = TestExecutionReport::not_executed(Vec::new());
        report.executed = true;
        report.success = true;
        report.command = Some("npm test -- --coverage".to_string());
        report.overall_line_coverage_percent = Some(80.0);
        Self::new(report)
    }

    pub fn seen(&self) -> Vec<Vec<DraftEdit>> {
        locked(&self.seen).clone()
    }
}

impl TestVerifier for FakeVerifier {
    fn verify(
        &self,
        _repo: &Path,
        _snapshot: &RepoSnapshot,
        edits: &[DraftEdit],
    ) -> Result<TestExecutionReport> {
        locked(&self.seen).push(edits.to_vec());
        Ok(self.report.clone())
    }
}

/// One fake per collaborator, shared so tests can inspect them afterwards.
#[derive(Clone)]
pub struct Fakes {
    pub tracker: Arc<FakeTracker>,
    pub scanner: Arc<FakeScanner>,
    pub vcs: Arc<RecordingVcs>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub feedback: Arc<InMemoryFeedback>,
    pub verifier: Arc<FakeVerifier>,
}

impl Fakes {
    /// Fakes for a TypeScript repository whose tests pass.
    pub fn new(reasoner: ScriptedReasoner) -> Self {
        Self {
            tracker: Arc::new(FakeTracker::new(TrackerBehavior::Task(task("PROJ-42")))),
            scanner: Arc::new(FakeScanner {
                snapshot: ts_snapshot(),
            }),
            vcs: Arc::new(RecordingVcs::new()),
            reasoner: Arc::new(reasoner),
            feedback: Arc::new(InMemoryFeedback::default()),
            verifier: Arc::new(FakeVerifier::passing()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            tracker: self.tracker.clone(),
            scanner: self.scanner.clone(),
            vcs: self.vcs.clone(),
            reasoner: self.reasoner.clone(),
            feedback: self.feedback.clone(),
            verifier: self.verifier.clone(),
        }
    }

    pub fn service(&self) -> Result<RunService> {
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(self.collaborators(), &config)?;
        Ok(RunService::new(
            pipeline,
            Arc::new(InMemoryRunStore::new()),
            config.default_target_branch,
        ))
    }
}

/// Fresh git repository on `develop` with one commit.
pub fn init_git_repo() -> Result<tempfile::TempDir> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    std::fs::write(root.join("README.md"), "hello\n")?;
    let steps: [&[&str]; 5] = [
        &["init", "-q", "-b", "develop"],
        &["config", "user.email", "dev@example.com"],
        &["config", "user.name", "Dev"],
        &["add", "-A"],
        &["commit", "-q", "-m", "initial"],
    ];
    for args in steps {
        let status = Command::new("git").args(args).current_dir(root).status()?;
        if !status.success() {
            return Err(anyhow!("git {args:?} failed"));
        }
    }
    Ok(temp)
}
