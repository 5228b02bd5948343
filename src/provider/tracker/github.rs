use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::http::{client, status_error, transport_error};
use super::{IssueDraft, IssueTracker, RemoteComment, RemoteIssue};
use crate::config::StateProviderSection;
use crate::errors::{StateError, StateResult};

const GITHUB_API_URL: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

/// A GitHub issue (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<serde_json::Value>,
}

impl From<GitHubIssue> for RemoteIssue {
    fn from(issue: GitHubIssue) -> Self {
        RemoteIssue {
            id: issue.number.to_string(),
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            open: issue.state == "open",
            version: issue.updated_at.to_rfc3339(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubComment {
    body: Option<String>,
    created_at: DateTime<Utc>,
}

/// GitHub Issues over the REST API, scoped to one `owner/repo`.
pub struct GitHubIssues {
    client: reqwest::Client,
    api_url: String,
    repository: String,
    token: String,
}

impl GitHubIssues {
    pub fn new(
        api_url: Option<&str>,
        repository: &str,
        token: String,
        timeout: std::time::Duration,
    ) -> StateResult<Self> {
        Ok(Self {
            client: client(timeout)?,
            api_url: api_url
                .filter(|u| !u.is_empty())
                .unwrap_or(GITHUB_API_URL)
                .trim_end_matches('/')
                .to_string(),
            repository: repository.to_string(),
            token,
        })
    }

    pub fn from_config(section: &StateProviderSection) -> anyhow::Result<Self> {
        let repository = section
            .repository
            .as_deref()
            .filter(|r| r.contains('/'))
            .context("state_provider.repository must be set to 'owner/repo' for the github provider")?;
        let token = section.api_key()?;
        Ok(Self::new(
            section.api_url.as_deref(),
            repository,
            token,
            section.request_timeout(),
        )?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, self.repository, path)
    }

    async fn send(
        &self,
        resource: &str,
        request: reqwest::RequestBuilder,
    ) -> StateResult<reqwest::Response> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| transport_error("github", resource, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(status_error("github", resource, status, &headers, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        resource: &str,
        response: reqwest::Response,
    ) -> StateResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| StateError::unavailable("github", format!("invalid {} response: {}", resource, e)))
    }

    async fn fetch_issue(&self, id: &str) -> StateResult<GitHubIssue> {
        let resource = format!("issue #{}", id);
        let response = self
            .send(&resource, self.client.get(self.url(&format!("/issues/{}", id))))
            .await?;
        Self::json(&resource, response).await
    }
}

#[async_trait]
impl IssueTracker for GitHubIssues {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn list_issues(&self) -> StateResult<Vec<RemoteIssue>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let per_page = PER_PAGE.to_string();
            let request = self.client.get(self.url("/issues")).query(&[
                ("state", "all"),
                ("per_page", per_page.as_str()),
                ("page", page_str.as_str()),
                ("sort", "created"),
                ("direction", "asc"),
            ]);
            let response = self.send("issues", request).await?;
            let batch: Vec<GitHubIssue> = Self::json("issues", response).await?;
            let count = batch.len();
            all.extend(
                batch
                    .into_iter()
                    .filter(|i| i.pull_request.is_none())
                    .map(RemoteIssue::from),
            );
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn get_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>> {
        match self.fetch_issue(id).await {
            Ok(issue) if issue.pull_request.is_none() => Ok(Some(issue.into())),
            Ok(_) | Err(StateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_issue(&self, draft: &IssueDraft) -> StateResult<RemoteIssue> {
        let request = self.client.post(self.url("/issues")).json(&json!({
            "title": draft.title,
            "body": draft.body,
            "labels": draft.labels,
        }));
        let response = self.send("new issue", request).await?;
        let created: RemoteIssue = Self::json::<GitHubIssue>("new issue", response).await?.into();
        if draft.open {
            return Ok(created);
        }
        self.update_issue(&created.id, &created.version, draft).await
    }

    async fn update_issue(
        &self,
        id: &str,
        expected_version: &str,
        draft: &IssueDraft,
    ) -> StateResult<RemoteIssue> {
        let resource = format!("issue #{}", id);
        let current: RemoteIssue = self.fetch_issue(id).await?.into();
        if current.version != expected_version {
            return Err(StateError::ConcurrentModification {
                resource,
                expected: expected_version.to_string(),
                found: current.version,
            });
        }
        let request = self
            .client
            .patch(self.url(&format!("/issues/{}", id)))
            .json(&json!({
                "title": draft.title,
                "body": draft.body,
                "labels": draft.labels,
                "state": if draft.open { "open" } else { "closed" },
            }));
        let response = self.send(&resource, request).await?;
        Ok(Self::json::<GitHubIssue>(&resource, response).await?.into())
    }

    async fn list_comments(&self, id: &str) -> StateResult<Vec<RemoteComment>> {
        let resource = format!("comments on #{}", id);
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let per_page = PER_PAGE.to_string();
            let request = self
                .client
                .get(self.url(&format!("/issues/{}/comments", id)))
                .query(&[("per_page", per_page.as_str()), ("page", page_str.as_str())]);
            let response = self.send(&resource, request).await?;
            let batch: Vec<GitHubComment> = Self::json(&resource, response).await?;
            let count = batch.len();
            all.extend(batch.into_iter().map(|c| RemoteComment {
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            }));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn add_comment(&self, id: &str, body: &str) -> StateResult<()> {
        let resource = format!("comments on #{}", id);
        let request = self
            .client
            .post(self.url(&format!("/issues/{}/comments", id)))
            .json(&json!({ "body": body }));
        self.send(&resource, request).await?;
        Ok(())
    }
}
