//! Pipeline orchestrator: the collaborators a run talks to, and the two
//! fixed stage sequences (start, finalize) that drive a run record.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::core::types::DraftEdit;
use crate::io::config::PipelineConfig;
use crate::io::feedback::FeedbackMemory;
use crate::io::git::VersionControl;
use crate::io::prompt::PromptBuilder;
use crate::io::reasoner::Reasoner;
use crate::io::scanner::RepoScanner;
use crate::io::tracker::TaskTracker;
use crate::io::verification::TestVerifier;

/// Services a run depends on. Cheap to clone.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn TaskTracker>,
    pub scanner: Arc<dyn RepoScanner>,
    pub vcs: Arc<dyn VersionControl>,
    pub reasoner: Arc<dyn Reasoner>,
    pub feedback: Arc<dyn FeedbackMemory>,
    pub verifier: Arc<dyn TestVerifier>,
}

/// Runs the start and finalize sequences. Holds no per-run state.
pub struct Pipeline {
    pub(crate) collaborators: Collaborators,
    pub(crate) prompts: PromptBuilder,
    pub(crate) max_draft_attempts: u32,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            collaborators,
            prompts: PromptBuilder::new(config.prompt_budget_bytes)?,
            max_draft_attempts: config.max_draft_attempts,
        })
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }
}

/// Human-readable preview of an edit set against the current tree.
pub fn render_edit_preview(repo: &Path, edits: &[DraftEdit]) -> String {
    let mut out = String::new();
    for edit in edits {
        let existing = repo.join(&edit.path).is_file();
        let kind = if existing { "modified" } else { "new file" };
        let lines = edit.content.lines().count();
        out.push_str(&format!("=== {} ({kind}, {lines} lines) ===\n", edit.path));
        if !edit.rationale.trim().is_empty() {
            out.push_str(&format!("# {}\n", edit.rationale.trim()));
        }
        out.push_str(&edit.content);
        if !edit.content.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_marks_new_and_modified_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.ts"), "old\n").expect("write");
        let preview = render_edit_preview(
            temp.path(),
            &[
                DraftEdit {
                    path: "a.ts".to_string(),
                    content: "new\n".to_string(),
                    rationale: "fix".to_string(),
                },
                DraftEdit {
                    path: "a.test.ts".to_string(),
                    content: "t".to_string(),
                    rationale: String::new(),
                },
            ],
        );
        assert!(preview.starts_with("=== a.ts (modified, 1 lines) ===\n# fix\nnew\n"));
        assert!(preview.contains("=== a.test.ts (new file, 1 lines) ===\nt\n"));
    }
}
