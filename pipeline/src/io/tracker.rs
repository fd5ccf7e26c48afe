//! Issue tracker collaborator: Jira and GitLab over blocking REST calls.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::errors::TransportError;
use crate::core::types::{TaskDetails, TrackerKind};
use crate::io::config::{GitLabCredentials, JiraCredentials};
use crate::io::git::encode_project;

const REQUEST_TIMEOUT_SECS: u64 = 30;

pub trait TaskTracker: Send + Sync {
    fn fetch_task(&self, kind: TrackerKind, task_id: &str) -> Result<TaskDetails>;
}

/// [`TaskTracker`] reading credentials from the environment on each fetch,
/// so a missing variable fails the run that needs it and nothing else.
pub struct HttpTracker {
    client: Client,
}

impl HttpTracker {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("create HTTP client")?;
        Ok(Self { client })
    }

    fn fetch_jira(&self, creds: &JiraCredentials, key: &str) -> Result<TaskDetails> {
        let url = format!("{}/rest/api/2/issue/{key}", creds.base_url);
        let request = self
            .client
            .get(&url)
            .basic_auth(&creds.email, Some(&creds.api_token));
        let issue: JiraIssue = send_json("jira", request)?;
        Ok(issue.into_task(&creds.base_url))
    }

    fn fetch_gitlab(&self, creds: &GitLabCredentials, iid: &str) -> Result<TaskDetails> {
        let url = format!(
            "{}/api/v4/projects/{}/issues/{}",
            creds.base_url,
            encode_project(&creds.project_id),
            iid.trim_start_matches('#')
        );
        let request = self.client.get(&url).header("PRIVATE-TOKEN", &creds.token);
        let issue: GitLabIssue = send_json("gitlab", request)?;
        Ok(issue.into_task())
    }
}

impl TaskTracker for HttpTracker {
    #[instrument(skip_all, fields(tracker = kind.as_str(), task_id))]
    fn fetch_task(&self, kind: TrackerKind, task_id: &str) -> Result<TaskDetails> {
        let task = match kind {
            TrackerKind::Jira => self.fetch_jira(&JiraCredentials::from_env()?, task_id)?,
            TrackerKind::Gitlab => self.fetch_gitlab(&GitLabCredentials::from_env()?, task_id)?,
        };
        debug!(title = %task.title, labels = task.labels.len(), "fetched task");
        Ok(task)
    }
}

fn send_json<T: DeserializeOwned>(service: &str, request: RequestBuilder) -> Result<T> {
    let transport = |message: String| TransportError {
        service: service.to_string(),
        message,
    };
    let resp = request
        .header("Accept", "application/json")
        .send()
        .map_err(|err| transport(err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        let body: String = body.chars().take(300).collect();
        return Err(transport(format!("{status}: {}", body.trim())).into());
    }
    resp.json()
        .map_err(|err| transport(format!("parse response: {err}")).into())
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
    fields: JiraFields,
}

#[derive(Debug, Deserialize)]
struct JiraFields {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    priority: Option<JiraPriority>,
}

#[derive(Debug, Deserialize)]
struct JiraPriority {
    name: String,
}

impl JiraIssue {
    fn into_task(self, base_url: &str) -> TaskDetails {
        TaskDetails {
            url: Some(format!("{base_url}/browse/{}", self.key)),
            id: self.key,
            title: self.fields.summary,
            description: self.fields.description.unwrap_or_default(),
            labels: self.fields.labels,
            priority: self.fields.priority.map(|p| p.name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabIssue {
    iid: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    web_url: Option<String>,
}

impl GitLabIssue {
    fn into_task(self) -> TaskDetails {
        // GitLab has no priority field; scoped labels carry it by convention.
        let priority = self
            .labels
            .iter()
            .find_map(|label| label.strip_prefix("priority::"))
            .map(str::to_string);
        TaskDetails {
            id: self.iid.to_string(),
            title: self.title,
            description: self.description.unwrap_or_default(),
            labels: self.labels,
            priority,
            url: self.web_url,
        }
    }
}
