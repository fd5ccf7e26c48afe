//! Pipeline configuration (TOML) and tracker credentials (environment).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::errors::ConfigurationError;
use crate::core::run::DEFAULT_TARGET_BRANCH;

/// Pipeline configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Drafting attempts before the unit-test gate gives up.
    pub max_draft_attempts: u32,

    /// Wall-clock bound for one test/coverage command.
    pub verification_timeout_secs: u64,

    /// Per-stream byte bound for test/coverage command output.
    pub verification_output_limit_bytes: usize,

    /// Size of the stdout/stderr snippets kept in a test report.
    pub snippet_limit_bytes: usize,

    /// Upper bound for a rendered prompt.
    pub prompt_budget_bytes: usize,

    /// Newest feedback records kept per repository.
    pub feedback_history_cap: usize,

    pub default_target_branch: String,

    pub reasoner: ReasonerConfig,
    pub scanner: ScannerConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// CLI that reads a prompt on stdin and answers on stdout.
    pub command: Vec<String>,
    /// Model for proposals and drafts; omitted from the command when empty.
    pub model: String,
    /// Model for short analyses; falls back to `model` when empty.
    pub fast_model: String,
    /// Flag that precedes the model name.
    pub model_flag: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            model: String::new(),
            fast_model: String::new(),
            model_flag: "-m".to_string(),
            timeout_secs: 600,
            output_limit_bytes: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub sample_files: usize,
    pub max_files: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sample_files: 20,
            max_files: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_draft_attempts: 2,
            verification_timeout_secs: 15 * 60,
            verification_output_limit_bytes: 1_000_000,
            snippet_limit_bytes: 4_000,
            prompt_budget_bytes: 60_000,
            feedback_history_cap: 50,
            default_target_branch: DEFAULT_TARGET_BRANCH.to_string(),
            reasoner: ReasonerConfig::default(),
            scanner: ScannerConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_draft_attempts == 0 {
            return Err(anyhow!("max_draft_attempts must be > 0"));
        }
        if self.verification_timeout_secs == 0 {
            return Err(anyhow!("verification_timeout_secs must be > 0"));
        }
        if self.verification_output_limit_bytes == 0 {
            return Err(anyhow!("verification_output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.feedback_history_cap == 0 {
            return Err(anyhow!("feedback_history_cap must be > 0"));
        }
        if self.default_target_branch.trim().is_empty() {
            return Err(anyhow!("default_target_branch must be non-empty"));
        }
        if self.reasoner.command.is_empty() || self.reasoner.command[0].trim().is_empty() {
            return Err(anyhow!("reasoner.command must be a non-empty array"));
        }
        if self.reasoner.timeout_secs == 0 || self.reasoner.output_limit_bytes == 0 {
            return Err(anyhow!("reasoner timeout and output limit must be > 0"));
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Jira REST credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
}

/// GitLab REST credentials scoped to one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitLabCredentials {
    pub base_url: String,
    pub token: String,
    pub project_id: String,
}

impl JiraCredentials {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let [base_url, email, api_token] =
            require("jira", ["JIRA_BASE_URL", "JIRA_EMAIL", "JIRA_API_TOKEN"], lookup)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
            api_token,
        })
    }
}

impl GitLabCredentials {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let [base_url, token, project_id] = require(
            "gitlab",
            ["GITLAB_BASE_URL", "GITLAB_TOKEN", "GITLAB_PROJECT_ID"],
            lookup,
        )?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            project_id,
        })
    }
}

fn require<const N: usize>(
    service: &str,
    keys: [&str; N],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<[String; N], ConfigurationError> {
    let values = keys.map(|key| lookup(key).filter(|value| !value.trim().is_empty()));
    let missing: Vec<String> = keys
        .iter()
        .zip(&values)
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ConfigurationError {
            service: service.to_string(),
            missing,
        });
    }
    Ok(values.map(Option::unwrap_or_default))
}
