//! Read-only client for the code host: a pull request, its check runs and
//! its reviews, gathered into the signals the resolver works from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use slacker_core::{CheckRun, Review, Signals};
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::{with_retry, RemoteError, RetryPolicy, TRACKING_RETRY};

pub const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "slacker-bot";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The fields of a pull request the bot cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSnapshot {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub merged: bool,
    pub closed: bool,
    pub head_sha: String,
    pub requested_reviewers: Vec<String>,
    pub requested_teams: Vec<String>,
}

/// Read access to the code-hosting service.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    async fn fetch_item(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSnapshot, RemoteError>;

    async fn fetch_checks(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CheckRun>, RemoteError>;

    async fn fetch_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Review>, RemoteError>;
}

/// Collect the resolver's inputs for one pull request.
///
/// The pull request itself must be readable. Checks and reviews degrade to
/// empty lists on failure, and are not fetched at all once the pull request
/// is merged or closed.
pub async fn fetch_signals(
    api: &dyn TrackingApi,
    owner: &str,
    repo: &str,
    number: u64,
) -> Result<(PullRequestSnapshot, Signals), RemoteError> {
    let pr = api.fetch_item(owner, repo, number).await?;

    let mut signals = Signals {
        merged: pr.merged,
        closed: pr.closed,
        author: pr.author.clone(),
        requested_reviewers: pr.requested_reviewers.clone(),
        requested_teams: pr.requested_teams.clone(),
        ..Signals::default()
    };

    if pr.merged || pr.closed {
        debug!("{}/{}#{} is no longer open, skipping checks and reviews", owner, repo, number);
        return Ok((pr, signals));
    }

    signals.checks = match api.fetch_checks(owner, repo, &pr.head_sha).await {
        Ok(checks) => checks,
        Err(e) => {
            warn!("Failed to fetch checks for {}/{}#{}: {}", owner, repo, number, e);
            Vec::new()
        }
    };

    signals.reviews = match api.fetch_reviews(owner, repo, number).await {
        Ok(reviews) => reviews,
        Err(e) => {
            warn!("Failed to fetch reviews for {}/{}#{}: {}", owner, repo, number, e);
            Vec::new()
        }
    };

    Ok((pr, signals))
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct TeamResponse {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct HeadResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    title: String,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merged_at: Option<String>,
    user: UserResponse,
    head: HeadResponse,
    #[serde(default)]
    requested_reviewers: Vec<UserResponse>,
    #[serde(default)]
    requested_teams: Vec<TeamResponse>,
}

impl From<PullRequestResponse> for PullRequestSnapshot {
    fn from(pr: PullRequestResponse) -> Self {
        let merged = pr.merged || pr.merged_at.is_some();
        Self {
            number: pr.number,
            title: pr.title,
            author: pr.user.login,
            merged,
            closed: pr.state == "closed" && !merged,
            head_sha: pr.head.sha,
            requested_reviewers: pr.requested_reviewers.into_iter().map(|u| u.login).collect(),
            requested_teams: pr.requested_teams.into_iter().map(|t| t.slug).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    user: Option<UserResponse>,
    state: String,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    token: String,
    api_base: String,
    retry: RetryPolicy,
}

impl GitHubClient {
    pub fn new(token: String) -> Result<Self> {
        Self::with_base_url(token, GITHUB_API_BASE)
    }

    pub fn with_base_url(token: String, api_base: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build GitHub HTTP client")?;

        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            retry: TRACKING_RETRY,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, url: &str) -> Result<T, RemoteError> {
        with_retry(&self.retry, operation, || async move {
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
                .send()
                .await
                .map_err(|e| RemoteError::from_reqwest(operation, e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RemoteError::from_status(operation, status, &body));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| RemoteError::from_reqwest(operation, e))
        })
        .await
    }
}

#[async_trait]
impl TrackingApi for GitHubClient {
    async fn fetch_item(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSnapshot, RemoteError> {
        let url = format!("{}/repos/{}/{}/pulls/{}", self.api_base, owner, repo, number);
        let pr: PullRequestResponse = self.get_json("fetch pull request", &url).await?;
        Ok(pr.into())
    }

    async fn fetch_checks(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CheckRun>, RemoteError> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}/check-runs?per_page=100",
            self.api_base, owner, repo, git_ref
        );
        let response: CheckRunsResponse = self.get_json("fetch check runs", &url).await?;
        Ok(response
            .check_runs
            .into_iter()
            .map(|run| CheckRun {
                name: run.name,
                status: run.status,
                conclusion: run.conclusion,
            })
            .collect())
    }

    async fn fetch_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Review>, RemoteError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/reviews?per_page=100",
            self.api_base, owner, repo, number
        );
        let reviews: Vec<ReviewResponse> = self.get_json("fetch reviews", &url).await?;
        // Reviews from deleted accounts have no user.
        Ok(reviews
            .into_iter()
            .filter_map(|r| {
                r.user.map(|user| Review {
                    reviewer: user.login,
                    state: r.state,
                })
            })
            .collect())
    }
}
