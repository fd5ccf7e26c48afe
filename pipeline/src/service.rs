//! Run lifecycle entry points: start, review, get, list.
//!
//! Runs against one repository path are serialized: the start sequence and
//! the finalize sequence each hold that repository's lock for their whole
//! duration. Runs against different repositories proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::run::{RunInput, RunPatch, RunRecord, RunStatus};
use crate::io::feedback::FeedbackRecord;
use crate::io::run_store::{RunStore, new_run_id};
use crate::orchestrator::Pipeline;

/// Reviewer decision for a run awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

pub struct RunService {
    pipeline: Pipeline,
    store: Arc<dyn RunStore>,
    default_target_branch: String,
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RunService {
    pub fn new(
        pipeline: Pipeline,
        store: Arc<dyn RunStore>,
        default_target_branch: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            store,
            default_target_branch: default_target_branch.into(),
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, repo: &Path) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .repo_locks
            .lock()
            .map_err(|_| anyhow!("repository lock table poisoned"))?;
        Ok(locks.entry(repo.to_path_buf()).or_default().clone())
    }

    /// Run the start sequence and store the resulting record.
    ///
    /// Stage failures do not make this return `Err`: the record comes back
    /// `failed` with the message.
    #[instrument(skip_all, fields(task = %input.task_id, tracker = input.tracker.as_str()))]
    pub fn start_run(&self, mut input: RunInput) -> Result<RunRecord> {
        if input.target_branch.trim().is_empty() {
            input.target_branch = self.default_target_branch.clone();
        }
        let run_id = new_run_id();
        info!(%run_id, "starting run");

        let lock = self.repo_lock(&input.repo_path)?;
        let patch = {
            let _guard = lock
                .lock()
                .map_err(|_| anyhow!("repository lock poisoned"))?;
            self.pipeline.start(&input)
        };

        let mut record = RunRecord::new(run_id, Utc::now(), input, RunStatus::AwaitingApproval);
        record.apply(patch);
        self.store.put(record.clone())?;
        info!(run_id = %record.run_id, status = record.status.as_str(), "run stored");
        Ok(record)
    }

    /// Approve or reject a run that is awaiting approval.
    ///
    /// A run in any other status yields `InvalidTransitionError`; an unknown
    /// id yields `RunNotFoundError`.
    #[instrument(skip_all, fields(run_id = %run_id, approved = review.approved))]
    pub fn review_run(&self, run_id: &str, review: ReviewRequest) -> Result<RunRecord> {
        let current = self.store.get(run_id)?;
        let note = review
            .feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        let mut history = current.feedback_history.clone();
        history.extend(note.clone());
        let history_patch = RunPatch {
            feedback_history: Some(history),
            ..RunPatch::default()
        };

        if !review.approved {
            let record = self
                .store
                .transition(run_id, RunStatus::Rejected, history_patch)?;
            self.remember(&record, false, note);
            info!("run rejected");
            return Ok(record);
        }

        let lock = self.repo_lock(&current.input.repo_path)?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow!("repository lock poisoned"))?;
        let applying = self
            .store
            .transition(run_id, RunStatus::Applying, history_patch)?;
        self.remember(&applying, true, note.clone());

        let patch = self.pipeline.finalize(&applying, note.as_deref());
        let record = self.store.update(run_id, patch)?;
        info!(status = record.status.as_str(), "review applied");
        Ok(record)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.store.get(run_id)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.store.list()
    }

    /// Persist the decision for future bias summaries. Failing to do so does
    /// not undo the decision.
    fn remember(&self, record: &RunRecord, approved: bool, note: Option<String>) {
        let entry = FeedbackRecord {
            run_id: record.run_id.clone(),
            task_id: record.input.task_id.clone(),
            approved,
            feedback: note,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self
            .pipeline
            .collaborators()
            .feedback
            .append_feedback(&record.input.repo_path, entry)
        {
            warn!(error = %format!("{err:#}"), "could not record reviewer feedback");
        }
    }
}
