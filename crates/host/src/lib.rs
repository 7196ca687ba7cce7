//! Code-host client collaborator: fetch pull-request metadata/files and
//! post/update a review comment.
//!
//! This is a working default implementation of the code-host-client
//! collaborator contract against the GitHub REST API, not the subject
//! of this crate's design — the pipeline is written against the
//! `HostClient` trait.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: FileStatus,
    pub additions: u64,
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head_sha: String,
    pub base_branch: String,
    pub labels: Vec<String>,
    pub author: String,
}

/// The code-host-client collaborator contract: fetch a PR's metadata
/// and changed files, then post or update its review comment.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn fetch_pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequest, HostError>;
    async fn fetch_pull_request_files(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<PullRequestFile>, HostError>;
    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<u64>, HostError>;
    /// Posts a new review carrying `event` (`COMMENT` or `REQUEST_CHANGES`,
    /// never `APPROVE`), or edits the body of the existing one carrying
    /// `marker` on its last line. GitHub reviews can't change event after
    /// submission, so an edit only ever updates body text.
    async fn upsert_review_comment(&self, owner: &str, repo: &str, number: u64, body: &str, marker: &str, event: &str) -> Result<(), HostError>;
    /// Remaining API quota, for the global preflight probe.
    async fn remaining_quota(&self) -> Result<u64, HostError>;
    /// Whether `owner/repo` is reachable with current credentials.
    async fn repo_accessible(&self, owner: &str, repo: &str) -> Result<bool, HostError>;
    /// True if a comment carrying `<!-- marker: headSha -->` already exists.
    async fn has_review_for_sha(&self, owner: &str, repo: &str, number: u64, marker: &str, head_sha: &str) -> Result<bool, HostError>;
    /// Unified diff of filenames changed between two commits, for
    /// incremental review mode.
    async fn diff_filenames(&self, owner: &str, repo: &str, base_sha: &str, head_sha: &str) -> Result<Vec<String>, HostError>;
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    title: String,
    head: GhRef,
    base: GhRef,
    labels: Vec<GhLabel>,
    user: GhUser,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct GhFile {
    filename: String,
    status: String,
    additions: u64,
    deletions: u64,
    #[serde(default)]
    patch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    id: u64,
    #[serde(default)]
    body: String,
}

fn parse_status(raw: &str) -> FileStatus {
    match raw {
        "added" => FileStatus::Added,
        "removed" => FileStatus::Removed,
        "renamed" => FileStatus::Renamed,
        _ => FileStatus::Modified,
    }
}

pub struct GitHubClient {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Self {
        Self { client: Client::new(), api_base: "https://api.github.com".to_string(), token }
    }

    #[cfg(test)]
    pub fn with_api_base(api_base: String, token: Option<String>) -> Self {
        Self { client: Client::new(), api_base, token }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("User-Agent", "revbot");
        match &self.token {
            Some(t) if !t.is_empty() => builder.bearer_auth(t),
            _ => builder,
        }
    }
}

#[async_trait]
impl HostClient for GitHubClient {
    async fn fetch_pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequest, HostError> {
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}", self.api_base);
        tracing::debug!(%owner, %repo, number, "fetching pull request");
        let resp = self.authed(self.client.get(url)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(format!("{owner}/{repo}#{number}")));
        }
        let gh: GhPullRequest = resp.json().await?;
        Ok(PullRequest {
            number: gh.number,
            title: gh.title,
            head_sha: gh.head.sha,
            base_branch: gh.base.ref_name,
            labels: gh.labels.into_iter().map(|l| l.name).collect(),
            author: gh.user.login,
        })
    }

    async fn fetch_pull_request_files(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<PullRequestFile>, HostError> {
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}/files", self.api_base);
        let resp = self.authed(self.client.get(url).query(&[("per_page", "100")])).send().await?;
        let files: Vec<GhFile> = resp.json().await?;
        Ok(files
            .into_iter()
            .map(|f| PullRequestFile {
                filename: f.filename,
                status: parse_status(&f.status),
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch,
            })
            .collect())
    }

    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<u64>, HostError> {
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.api_base);
        let resp = self
            .authed(self.client.get(url).query(&[("state", "open"), ("per_page", "100")]))
            .send()
            .await?;
        let prs: Vec<GhPullRequest> = resp.json().await?;
        Ok(prs.into_iter().map(|p| p.number).collect())
    }

    async fn upsert_review_comment(&self, owner: &str, repo: &str, number: u64, body: &str, marker: &str, event: &str) -> Result<(), HostError> {
        let list_url = format!("{}/repos/{owner}/{repo}/pulls/{number}/reviews", self.api_base);
        let resp = self
            .authed(self.client.get(&list_url).query(&[("per_page", "100")]))
            .send()
            .await?;
        let reviews: Vec<GhReview> = resp.json().await?;
        let needle = format!("{marker}:");
        let existing = reviews.iter().find(|r| r.body.lines().last().map(|l| l.contains(&needle)).unwrap_or(false));

        if let Some(existing) = existing {
            let edit_url = format!("{}/repos/{owner}/{repo}/pulls/{number}/reviews/{}", self.api_base, existing.id);
            tracing::info!(%owner, %repo, number, review_id = existing.id, "updating existing review body");
            self.authed(self.client.put(edit_url).json(&serde_json::json!({ "body": body }))).send().await?;
        } else {
            tracing::info!(%owner, %repo, number, %event, "posting new review");
            self.authed(self.client.post(&list_url).json(&serde_json::json!({ "body": body, "event": event }))).send().await?;
        }
        Ok(())
    }

    async fn remaining_quota(&self) -> Result<u64, HostError> {
        let url = format!("{}/rate_limit", self.api_base);
        let resp = self.authed(self.client.get(url)).send().await?;
        let body: serde_json::Value = resp.json().await?;
        body.get("resources")
            .and_then(|r| r.get("core"))
            .and_then(|c| c.get("remaining"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HostError::InvalidResponse("missing resources.core.remaining".into()))
    }

    async fn repo_accessible(&self, owner: &str, repo: &str) -> Result<bool, HostError> {
        let url = format!("{}/repos/{owner}/{repo}", self.api_base);
        let resp = self.authed(self.client.get(url)).send().await?;
        Ok(resp.status().is_success())
    }

    async fn has_review_for_sha(&self, owner: &str, repo: &str, number: u64, marker: &str, head_sha: &str) -> Result<bool, HostError> {
        let list_url = format!("{}/repos/{owner}/{repo}/pulls/{number}/reviews", self.api_base);
        let resp = self.authed(self.client.get(&list_url).query(&[("per_page", "100")])).send().await?;
        let reviews: Vec<GhReview> = resp.json().await?;
        let needle = format!("<!-- {marker}: {head_sha} -->");
        Ok(reviews.iter().any(|r| r.body.lines().last().map(|l| l.trim() == needle).unwrap_or(false)))
    }

    async fn diff_filenames(&self, owner: &str, repo: &str, base_sha: &str, head_sha: &str) -> Result<Vec<String>, HostError> {
        let url = format!("{}/repos/{owner}/{repo}/compare/{base_sha}...{head_sha}", self.api_base);
        let resp = self.authed(self.client.get(url)).send().await?;
        let body: serde_json::Value = resp.json().await?;
        let files = body
            .get("files")
            .and_then(|f| f.as_array())
            .ok_or_else(|| HostError::InvalidResponse("missing files in compare response".into()))?;
        Ok(files
            .iter()
            .filter_map(|f| f.get("filename").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect())
    }
}
