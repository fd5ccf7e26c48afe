//! Reviewer feedback memory, persisted per repository.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::config::write_atomic;

/// State directory inside a target repository. It ignores itself in git.
pub const STATE_DIR: &str = ".pipeline";
const FEEDBACK_FILE: &str = "feedback.json";
const RECENT_NOTES: usize = 5;

/// One reviewer decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub run_id: String,
    pub task_id: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

pub trait FeedbackMemory: Send + Sync {
    fn append_feedback(&self, repo: &Path, record: FeedbackRecord) -> Result<()>;

    /// Short text describing past reviewer preferences; empty when none.
    fn summarize_bias(&self, repo: &Path) -> Result<String>;
}

/// [`FeedbackMemory`] backed by `<repo>/.pipeline/feedback.json`.
pub struct FileFeedbackMemory {
    cap: usize,
}

impl FileFeedbackMemory {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1) }
    }

    pub fn path_for(repo: &Path) -> PathBuf {
        repo.join(STATE_DIR).join(FEEDBACK_FILE)
    }

    pub fn load(repo: &Path) -> Result<Vec<FeedbackRecord>> {
        let path = Self::path_for(repo);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }
}

impl FeedbackMemory for FileFeedbackMemory {
    fn append_feedback(&self, repo: &Path, record: FeedbackRecord) -> Result<()> {
        let mut records = Self::load(repo)?;
        records.push(record);
        if records.len() > self.cap {
            let excess = records.len() - self.cap;
            records.drain(..excess);
        }

        let dir = repo.join(STATE_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let ignore = dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
        }

        let path = Self::path_for(repo);
        let mut buf = serde_json::to_string_pretty(&records)?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(path = %path.display(), records = records.len(), "feedback recorded");
        Ok(())
    }

    fn summarize_bias(&self, repo: &Path) -> Result<String> {
        Ok(summarize(&Self::load(repo)?))
    }
}

/// Render approval counts and the most recent reviewer notes.
pub fn summarize(records: &[FeedbackRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let approved = records.iter().filter(|r| r.approved).count();
    let rejected = records.len() - approved;
    let mut out = format!(
        "Past reviews for this repository: {approved} approved, {rejected} rejected."
    );
    let notes: Vec<&FeedbackRecord> = records
        .iter()
        .rev()
        .filter(|r| r.feedback.as_deref().is_some_and(|f| !f.trim().is_empty()))
        .take(RECENT_NOTES)
        .collect();
    if !notes.is_empty() {
        out.push_str("\nRecent reviewer notes (newest first):");
        for record in notes {
            let verdict = if record.approved { "approved" } else { "rejected" };
            let note = record.feedback.as_deref().unwrap_or_default().trim();
            out.push_str(&format!("\n- [{verdict} {}] {note}", record.task_id));
        }
    }
    out
}
