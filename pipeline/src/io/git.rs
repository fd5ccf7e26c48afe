//! Version-control collaborator and its `git` subprocess implementation.
//!
//! The pipeline only needs a handful of operations: branch preparation,
//! cleanliness checks, diffs, commit, push, and publishing a merge request.
//! They are kept behind [`VersionControl`] so the orchestrator can be driven
//! by a recording fake in tests.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{TransportError, WorktreeStateError};
use crate::io::config::GitLabCredentials;

const BRANCH_PREFIX: &str = "feature/";
const MAX_SLUG_LEN: usize = 60;
const PUBLISH_TIMEOUT_SECS: u64 = 30;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// A request to open a merge request for a pushed branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
}

/// Narrow version-control contract used by the orchestrator.
pub trait VersionControl: Send + Sync {
    /// Deterministic working-branch name for a task.
    fn build_branch_name(&self, task_id: &str) -> String;

    /// Fail with [`WorktreeStateError`] when the tree has uncommitted changes.
    fn ensure_clean(&self, repo: &Path) -> Result<()>;

    /// Check out `branch`, creating it from `base` when it does not exist.
    fn create_or_checkout_branch(&self, repo: &Path, branch: &str, base: &str) -> Result<()>;

    /// Unified diff of the working tree against `HEAD`, untracked files included.
    fn diff(&self, repo: &Path) -> Result<String>;

    /// Stage everything, commit, and return the new `HEAD` sha.
    fn stage_commit_and_get_sha(&self, repo: &Path, message: &str) -> Result<String>;

    fn push_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Open a change for review; `None` when publishing is not configured.
    fn publish_change(&self, repo: &Path, request: &ChangeRequest) -> Result<Option<String>>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// True when `rev` resolves to a commit.
    pub fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", &spec])?
            .status
            .success())
    }

    pub fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git diff HEAD` followed by a `/dev/null` diff for each untracked file.
    pub fn diff_with_untracked(&self) -> Result<String> {
        let mut diff = self.run_capture(&["diff", "HEAD"])?;
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        for path in untracked.lines().filter(|line| !line.trim().is_empty()) {
            // Exit status 1 means "files differ", which is always the case here.
            let out = self.run(&["diff", "--no-index", "--", "/dev/null", path])?;
            if out.status.code().is_some_and(|code| code > 1) {
                let stderr = String::from_utf8_lossy(&out.stderr);
                return Err(anyhow!("git diff --no-index {path} failed: {}", stderr.trim()));
            }
            diff.push_str(&String::from_utf8_lossy(&out.stdout));
        }
        Ok(diff)
    }

    pub fn push_upstream(&self, remote: &str, branch: &str) -> Result<String> {
        let output = self.run_checked(&["push", "-u", remote, branch])?;
        Ok(String::from_utf8_lossy(&output.stderr).to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Lowercase, `[a-z0-9]` runs joined by single dashes, bounded length.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_end_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        slug.push_str("task");
    }
    slug
}

/// [`VersionControl`] over the `git` CLI, publishing through the GitLab
/// merge request API when credentials are available.
pub struct GitVcs {
    remote: String,
    gitlab: Option<GitLabCredentials>,
}

impl GitVcs {
    pub fn new(remote: impl Into<String>, gitlab: Option<GitLabCredentials>) -> Self {
        Self {
            remote: remote.into(),
            gitlab,
        }
    }

    /// Remote from config; GitLab publishing only when its environment is set.
    pub fn from_env(remote: impl Into<String>) -> Self {
        let gitlab = match GitLabCredentials::from_env() {
            Ok(creds) => Some(creds),
            Err(err) => {
                debug!(%err, "merge request publishing disabled");
                None
            }
        };
        Self::new(remote, gitlab)
    }
}

impl VersionControl for GitVcs {
    fn build_branch_name(&self, task_id: &str) -> String {
        format!("{BRANCH_PREFIX}{}", slugify(task_id))
    }

    #[instrument(skip_all, fields(repo = %repo.display()))]
    fn ensure_clean(&self, repo: &Path) -> Result<()> {
        let entries = Git::new(repo).status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(count = entries.len(), "worktree not clean");
        Err(WorktreeStateError {
            repo_path: repo.display().to_string(),
            entries: entries
                .into_iter()
                .map(|entry| format!("{} {}", entry.code, entry.path))
                .collect(),
        }
        .into())
    }

    #[instrument(skip_all, fields(repo = %repo.display(), branch, base))]
    fn create_or_checkout_branch(&self, repo: &Path, branch: &str, base: &str) -> Result<()> {
        let git = Git::new(repo);
        if git.branch_exists(branch)? {
            debug!("checking out existing branch");
            return git.checkout_branch(branch);
        }
        let remote_base = format!("{}/{base}", self.remote);
        let start_point = if git.rev_exists(base)? {
            base.to_string()
        } else if git.rev_exists(&remote_base)? {
            remote_base
        } else {
            return Err(anyhow!("base branch '{base}' not found in {}", repo.display()));
        };
        info!(start_point = %start_point, "creating branch");
        git.checkout_new_branch(branch, &start_point)
    }

    fn diff(&self, repo: &Path) -> Result<String> {
        Git::new(repo).diff_with_untracked()
    }

    #[instrument(skip_all, fields(repo = %repo.display()))]
    fn stage_commit_and_get_sha(&self, repo: &Path, message: &str) -> Result<String> {
        let git = Git::new(repo);
        git.add_all()?;
        if !git.commit_staged(message)? {
            return Err(anyhow!("nothing to commit in {}", repo.display()));
        }
        let sha = git.head_sha()?;
        info!(sha = %sha, "committed");
        Ok(sha)
    }

    #[instrument(skip_all, fields(repo = %repo.display(), branch))]
    fn push_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        let remote_output = Git::new(repo).push_upstream(&self.remote, branch)?;
        debug!(output = %remote_output.trim(), "pushed");
        Ok(())
    }

    #[instrument(skip_all, fields(source = %request.source_branch, target = %request.target_branch))]
    fn publish_change(&self, _repo: &Path, request: &ChangeRequest) -> Result<Option<String>> {
        let Some(creds) = &self.gitlab else {
            info!("no merge request credentials, skipping publish");
            return Ok(None);
        };
        create_merge_request(creds, request).map(Some)
    }
}

#[derive(Debug, Serialize)]
struct CreateMergeRequest<'a> {
    source_branch: &'a str,
    target_branch: &'a str,
    title: &'a str,
    description: &'a str,
    remove_source_branch: bool,
}

#[derive(Debug, Deserialize)]
struct MergeRequestResponse {
    web_url: String,
}

fn create_merge_request(creds: &GitLabCredentials, request: &ChangeRequest) -> Result<String> {
    let transport = |message: String| TransportError {
        service: "gitlab".to_string(),
        message,
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(PUBLISH_TIMEOUT_SECS))
        .build()
        .context("create HTTP client")?;
    let url = format!(
        "{}/api/v4/projects/{}/merge_requests",
        creds.base_url,
        encode_project(&creds.project_id)
    );
    let body = CreateMergeRequest {
        source_branch: &request.source_branch,
        target_branch: &request.target_branch,
        title: &request.title,
        description: &request.description,
        remove_source_branch: true,
    };
    let resp = client
        .post(&url)
        .header("PRIVATE-TOKEN", &creds.token)
        .json(&body)
        .send()
        .map_err(|err| transport(err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().unwrap_or_default();
        return Err(transport(format!("{status}: {}", text.trim())).into());
    }
    let created: MergeRequestResponse = resp
        .json()
        .map_err(|err| transport(format!("parse merge request response: {err}")))?;
    info!(url = %created.web_url, "merge request opened");
    Ok(created.web_url)
}

/// Project ids may be numeric or `group/name` paths.
pub(crate) fn encode_project(project: &str) -> String {
    project.replace('/', "%2F")
}
