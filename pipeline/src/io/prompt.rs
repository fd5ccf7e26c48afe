//! Prompt builder for reasoning-service requests.
//!
//! Templates carry `<!-- section:KEY required|droppable -->` markers. After
//! rendering, droppable sections are removed in a fixed order until the
//! prompt fits the byte budget, and the last section is truncated if that is
//! still not enough.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::{DesignProposal, RepoSnapshot, TaskDetails, TestExecutionReport};

const PROPOSAL_TEMPLATE: &str = include_str!("prompts/proposal.md");
const DRAFT_TEMPLATE: &str = include_str!("prompts/draft.md");
const FAILURE_ANALYSIS_TEMPLATE: &str = include_str!("prompts/failure_analysis.md");

/// Droppable sections, least important first.
const DROP_ORDER: &[&str] = &["samples", "bias", "previous", "guidance", "stdout"];
const TRUNCATION_MARK: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// Inputs for the proposal request.
#[derive(Debug, Clone, Copy)]
pub struct ProposalInputs<'a> {
    pub task: &'a TaskDetails,
    pub snapshot: &'a RepoSnapshot,
    pub bias: &'a str,
    pub target_branch: &'a str,
}

/// Inputs for one drafting attempt.
#[derive(Debug, Clone, Copy)]
pub struct DraftInputs<'a> {
    pub task: &'a TaskDetails,
    pub snapshot: &'a RepoSnapshot,
    pub proposal: &'a DesignProposal,
    /// Reviewer notes and corrective instructions, oldest first.
    pub feedback: &'a [String],
    /// Paths of the edit set being revised, if any.
    pub previous_paths: &'a [String],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("proposal", PROPOSAL_TEMPLATE)
            .context("load proposal template")?;
        env.add_template("draft", DRAFT_TEMPLATE)
            .context("load draft template")?;
        env.add_template("failure_analysis", FAILURE_ANALYSIS_TEMPLATE)
            .context("load failure analysis template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn proposal(&self, input: ProposalInputs<'_>) -> Result<String> {
        let languages = input
            .snapshot
            .language_summary
            .iter()
            .map(|(name, count)| format!("{name} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        let rendered = self.env.get_template("proposal")?.render(context! {
            task => input.task,
            snapshot => input.snapshot,
            languages => languages,
            bias => input.bias.trim(),
            target_branch => input.target_branch,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn draft(&self, input: DraftInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("draft")?.render(context! {
            task => input.task,
            snapshot => input.snapshot,
            proposal => input.proposal,
            feedback => input.feedback,
            previous_paths => input.previous_paths,
        })?;
        Ok(self.fit(&rendered))
    }

    /// Short analysis request for a failed verification.
    pub fn failure_analysis(
        &self,
        report: &TestExecutionReport,
        paths: &[String],
    ) -> Result<String> {
        let cause = report
            .failure_cause
            .and_then(|cause| serde_json::to_value(cause).ok())
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let rendered = self.env.get_template("failure_analysis")?.render(context! {
            command => report.command.as_deref().unwrap_or("(none)"),
            cause => cause,
            paths => paths,
            stderr => report.stderr_snippet.as_deref().map(str::trim).unwrap_or_default(),
            stdout => report.stdout_snippet.as_deref().map(str::trim).unwrap_or_default(),
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let keep = last
        .content
        .len()
        .saturating_sub(over + TRUNCATION_MARK.len());
    let mut cut = keep;
    while !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    last.content.truncate(cut);
    last.content.push_str(TRUNCATION_MARK);
    debug!(section = %last.key, after_len = last.content.len(), "truncated section for budget");
}
