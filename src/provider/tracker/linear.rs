use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::{Mutex, OnceCell};

use super::http::{client, status_error, transport_error};
use super::{IssueDraft, IssueTracker, RemoteComment, RemoteIssue};
use crate::config::StateProviderSection;
use crate::errors::{StateError, StateResult};

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const ISSUE_FIELDS: &str = "fragment IssueFields on Issue {
  id identifier title description createdAt updatedAt
  state { type }
  labels { nodes { name } }
}";

const LIST_ISSUES: &str = "query Issues($teamId: String!, $after: String) {
  team(id: $teamId) {
    issues(first: 100, after: $after) {
      nodes { ...IssueFields }
      pageInfo { hasNextPage endCursor }
    }
  }
}";

const GET_ISSUE: &str = "query Issue($id: String!) { issue(id: $id) { ...IssueFields } }";

const CREATE_ISSUE: &str = "mutation CreateIssue($input: IssueCreateInput!) {
  issueCreate(input: $input) { success issue { ...IssueFields } }
}";

const UPDATE_ISSUE: &str = "mutation UpdateIssue($id: String!, $input: IssueUpdateInput!) {
  issueUpdate(id: $id, input: $input) { success issue { ...IssueFields } }
}";

const LIST_COMMENTS: &str = "query Comments($id: String!, $after: String) {
  issue(id: $id) {
    comments(first: 100, after: $after) {
      nodes { body createdAt }
      pageInfo { hasNextPage endCursor }
    }
  }
}";

const ADD_COMMENT: &str = "mutation AddComment($input: CommentCreateInput!) {
  commentCreate(input: $input) { success }
}";

const TEAM_SETUP: &str = "query Team($teamId: String!) {
  team(id: $teamId) {
    states { nodes { id type position } }
    labels(first: 250) { nodes { id name } }
  }
}";

const CREATE_LABEL: &str = "mutation CreateLabel($input: IssueLabelCreateInput!) {
  issueLabelCreate(input: $input) { success issueLabel { id name } }
}";

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    nodes: Vec<T>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct LinearState {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct LinearLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearIssue {
    identifier: String,
    title: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: LinearState,
    labels: Nodes<LinearLabel>,
}

impl From<LinearIssue> for RemoteIssue {
    fn from(issue: LinearIssue) -> Self {
        RemoteIssue {
            id: issue.identifier,
            title: issue.title,
            body: issue.description.unwrap_or_default(),
            labels: issue.labels.nodes.into_iter().map(|l| l.name).collect(),
            open: !matches!(issue.state.kind.as_str(), "completed" | "canceled"),
            version: issue.updated_at.to_rfc3339(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearComment {
    body: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WorkflowState {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    position: f64,
}

#[derive(Debug, Deserialize)]
struct TeamLabel {
    id: String,
    name: String,
}

/// Workflow state ids used for open and closed issues.
#[derive(Debug, Clone)]
struct StateIds {
    open: String,
    closed: String,
}

/// Pick the first `unstarted` (else `backlog`) state for open issues and the
/// first `completed` state for closed ones.
fn pick_states(mut states: Vec<WorkflowState>) -> Option<StateIds> {
    states.sort_by(|a, b| a.position.total_cmp(&b.position));
    let first = |kind: &str| states.iter().find(|s| s.kind == kind).map(|s| s.id.clone());
    Some(StateIds {
        open: first("unstarted").or_else(|| first("backlog"))?,
        closed: first("completed")?,
    })
}

fn graphql_error(resource: &str, errors: &[GraphQlError]) -> StateError {
    let code_is = |e: &GraphQlError, code: &str| {
        e.extensions
            .as_ref()
            .and_then(|x| x.get("code"))
            .and_then(Value::as_str)
            .is_some_and(|c| c.eq_ignore_ascii_case(code))
    };
    if errors.iter().any(|e| code_is(e, "RATELIMITED")) {
        return StateError::RateLimited {
            provider: "linear".to_string(),
            retry_after: None,
        };
    }
    if errors
        .iter()
        .any(|e| e.message.to_lowercase().contains("not found"))
    {
        return StateError::NotFound {
            kind: "issue",
            id: resource.to_string(),
        };
    }
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    StateError::unavailable("linear", format!("{}: {}", resource, messages.join("; ")))
}

/// Linear issues over the GraphQL API, scoped to one team.
pub struct LinearIssues {
    client: reqwest::Client,
    api_url: String,
    team_id: String,
    api_key: String,
    states: OnceCell<StateIds>,
    labels: Mutex<Option<HashMap<String, String>>>,
}

impl LinearIssues {
    pub fn new(
        api_url: Option<&str>,
        team_id: &str,
        api_key: String,
        timeout: std::time::Duration,
    ) -> StateResult<Self> {
        Ok(Self {
            client: client(timeout)?,
            api_url: api_url
                .filter(|u| !u.is_empty())
                .unwrap_or(LINEAR_API_URL)
                .to_string(),
            team_id: team_id.to_string(),
            api_key,
            states: OnceCell::new(),
            labels: Mutex::new(None),
        })
    }

    pub fn from_config(section: &StateProviderSection) -> anyhow::Result<Self> {
        let team_id = section
            .team_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .context("state_provider.team_id must be set for the linear provider")?;
        let api_key = section.api_key()?;
        Ok(Self::new(
            section.api_url.as_deref(),
            team_id,
            api_key,
            section.request_timeout(),
        )?)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        resource: &str,
        query: &str,
        variables: Value,
    ) -> StateResult<T> {
        let query = if query.contains("...IssueFields") {
            format!("{}\n{}", query, ISSUE_FIELDS)
        } else {
            query.to_string()
        };
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| transport_error("linear", resource, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("linear", resource, e))?;

        match serde_json::from_str::<GraphQlResponse<T>>(&text) {
            Ok(parsed) if !parsed.errors.is_empty() => Err(graphql_error(resource, &parsed.errors)),
            Ok(GraphQlResponse { data: Some(data), .. }) if status.is_success() => Ok(data),
            _ if !status.is_success() => Err(status_error("linear", resource, status, &headers, &text)),
            _ => Err(StateError::unavailable(
                "linear",
                format!("{} returned no data", resource),
            )),
        }
    }

    async fn state_ids(&self) -> StateResult<StateIds> {
        self.states
            .get_or_try_init(|| async {
                let data: Value = self
                    .graphql("team", TEAM_SETUP, json!({ "teamId": self.team_id }))
                    .await?;
                let states: Vec<WorkflowState> =
                    serde_json::from_value(data["team"]["states"]["nodes"].clone())
                        .map_err(|e| StateError::serde("linear states", e))?;
                pick_states(states).ok_or_else(|| {
                    StateError::unavailable(
                        "linear",
                        "team has no unstarted/backlog or completed workflow state",
                    )
                })
            })
            .await
            .cloned()
    }

    /// Resolve label names to ids, creating labels the team does not have yet.
    async fn label_ids(&self, names: &[String]) -> StateResult<Vec<String>> {
        let mut cache = self.labels.lock().await;
        if cache.is_none() {
            let data: Value = self
                .graphql("labels", TEAM_SETUP, json!({ "teamId": self.team_id }))
                .await?;
            let labels: Vec<TeamLabel> =
                serde_json::from_value(data["team"]["labels"]["nodes"].clone())
                    .map_err(|e| StateError::serde("linear labels", e))?;
            *cache = Some(labels.into_iter().map(|l| (l.name, l.id)).collect());
        }
        let known = cache.get_or_insert_with(HashMap::new);

        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            if let Some(id) = known.get(name) {
                ids.push(id.clone());
                continue;
            }
            let data: Value = self
                .graphql(
                    "label",
                    CREATE_LABEL,
                    json!({ "input": { "name": name, "teamId": self.team_id } }),
                )
                .await?;
            let id = data["issueLabelCreate"]["issueLabel"]["id"]
                .as_str()
                .ok_or_else(|| StateError::unavailable("linear", format!("label '{}' not created", name)))?
                .to_string();
            known.insert(name.clone(), id.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn fetch_issue(&self, id: &str) -> StateResult<Option<LinearIssue>> {
        #[derive(Deserialize)]
        struct Data {
            issue: Option<LinearIssue>,
        }
        match self
            .graphql::<Data>(&format!("issue {}", id), GET_ISSUE, json!({ "id": id }))
            .await
        {
            Ok(data) => Ok(data.issue),
            Err(StateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn draft_input(&self, draft: &IssueDraft) -> StateResult<Value> {
        let states = self.state_ids().await?;
        let label_ids = self.label_ids(&draft.labels).await?;
        let state_id = if draft.open { states.open } else { states.closed };
        Ok(json!({
            "title": draft.title,
            "description": draft.body,
            "labelIds": label_ids,
            "stateId": state_id,
        }))
    }
}

#[async_trait]
impl IssueTracker for LinearIssues {
    fn name(&self) -> &'static str {
        "linear"
    }

    async fn list_issues(&self) -> StateResult<Vec<RemoteIssue>> {
        #[derive(Deserialize)]
        struct Team {
            issues: Page<LinearIssue>,
        }
        #[derive(Deserialize)]
        struct Data {
            team: Team,
        }

        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let data: Data = self
                .graphql(
                    "issues",
                    LIST_ISSUES,
                    json!({ "teamId": self.team_id, "after": after }),
                )
                .await?;
            let page = data.team.issues;
            all.extend(page.nodes.into_iter().map(RemoteIssue::from));
            match page.page_info.end_cursor {
                Some(cursor) if page.page_info.has_next_page => after = Some(cursor),
                _ => break,
            }
        }
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    async fn get_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>> {
        Ok(self.fetch_issue(id).await?.map(RemoteIssue::from))
    }

    async fn create_issue(&self, draft: &IssueDraft) -> StateResult<RemoteIssue> {
        #[derive(Deserialize)]
        struct Payload {
            issue: Option<LinearIssue>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            issue_create: Payload,
        }

        let mut input = self.draft_input(draft).await?;
        input["teamId"] = json!(self.team_id);
        let data: Data = self
            .graphql("new issue", CREATE_ISSUE, json!({ "input": input }))
            .await?;
        data.issue_create
            .issue
            .map(RemoteIssue::from)
            .ok_or_else(|| StateError::unavailable("linear", "issueCreate returned no issue"))
    }

    async fn update_issue(
        &self,
        id: &str,
        expected_version: &str,
        draft: &IssueDraft,
    ) -> StateResult<RemoteIssue> {
        #[derive(Deserialize)]
        struct Payload {
            issue: Option<LinearIssue>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            issue_update: Payload,
        }

        let resource = format!("issue {}", id);
        let current = self
            .fetch_issue(id)
            .await?
            .map(RemoteIssue::from)
            .ok_or_else(|| StateError::NotFound {
                kind: "issue",
                id: id.to_string(),
            })?;
        if current.version != expected_version {
            return Err(StateError::ConcurrentModification {
                resource,
                expected: expected_version.to_string(),
                found: current.version,
            });
        }
        let input = self.draft_input(draft).await?;
        let data: Data = self
            .graphql(&resource, UPDATE_ISSUE, json!({ "id": id, "input": input }))
            .await?;
        data.issue_update
            .issue
            .map(RemoteIssue::from)
            .ok_or_else(|| StateError::unavailable("linear", "issueUpdate returned no issue"))
    }

    async fn list_comments(&self, id: &str) -> StateResult<Vec<RemoteComment>> {
        #[derive(Deserialize)]
        struct Issue {
            comments: Page<LinearComment>,
        }
        #[derive(Deserialize)]
        struct Data {
            issue: Option<Issue>,
        }

        let resource = format!("comments on {}", id);
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let data: Data = self
                .graphql(&resource, LIST_COMMENTS, json!({ "id": id, "after": after }))
                .await?;
            let Some(issue) = data.issue else {
                return Err(StateError::NotFound {
                    kind: "issue",
                    id: id.to_string(),
                });
            };
            let page = issue.comments;
            all.extend(page.nodes.into_iter().map(|c| RemoteComment {
                body: c.body,
                created_at: c.created_at,
            }));
            match page.page_info.end_cursor {
                Some(cursor) if page.page_info.has_next_page => after = Some(cursor),
                _ => break,
            }
        }
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn add_comment(&self, id: &str, body: &str) -> StateResult<()> {
        let _: Value = self
            .graphql(
                &format!("comments on {}", id),
                ADD_COMMENT,
                json!({ "input": { "issueId": id, "body": body } }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_node_maps_to_remote_issue() {
        let json = r#"{
            "id": "uuid-1", "identifier": "ENG-12", "title": "Implement login form",
            "description": null,
            "createdAt": "2026-01-02T03:04:05.000Z", "updatedAt": "2026-01-03T03:04:05.000Z",
            "state": {"type": "completed"},
            "labels": {"nodes": [{"name": "meta"}]}
        }"#;
        let issue: LinearIssue = serde_json::from_str(json).unwrap();
        let remote = RemoteIssue::from(issue);
        assert_eq!(remote.id, "ENG-12");
        assert!(!remote.open);
        assert_eq!(remote.labels, vec!["meta"]);
    }

    #[test]
    fn test_pick_states_prefers_unstarted() {
        let states = vec![
            WorkflowState { id: "done".into(), kind: "completed".into(), position: 3.0 },
            WorkflowState { id: "backlog".into(), kind: "backlog".into(), position: 0.0 },
            WorkflowState { id: "todo".into(), kind: "unstarted".into(), position: 1.0 },
        ];
        let ids = pick_states(states).unwrap();
        assert_eq!(ids.open, "todo");
        assert_eq!(ids.closed, "done");
    }

    #[test]
    fn test_pick_states_requires_completed() {
        let states = vec![WorkflowState {
            id: "todo".into(),
            kind: "unstarted".into(),
            position: 1.0,
        }];
        assert!(pick_states(states).is_none());
    }

    #[test]
    fn test_graphql_errors_classified() {
        let parsed: GraphQlResponse<Value> = serde_json::from_str(
            r#"{"errors":[{"message":"Rate limit exceeded","extensions":{"code":"RATELIMITED"}}]}"#,
        )
        .unwrap();
        assert!(matches!(
            graphql_error("issues", &parsed.errors),
            StateError::RateLimited { .. }
        ));

        let parsed: GraphQlResponse<Value> =
            serde_json::from_str(r#"{"errors":[{"message":"Entity not found: Issue"}]}"#).unwrap();
        assert!(matches!(
            graphql_error("issue ENG-1", &parsed.errors),
            StateError::NotFound { .. }
        ));

        let parsed: GraphQlResponse<Value> =
            serde_json::from_str(r#"{"errors":[{"message":"Argument Validation Error"}]}"#).unwrap();
        assert!(graphql_error("issues", &parsed.errors).is_transient());
    }
}
