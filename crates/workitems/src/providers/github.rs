//! GitHub pull request adapter

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{Capability, CapabilitySet, FetchedItem, HttpClient, Provider, ProviderContext, DEFAULT_SECTION};
use crate::error::ProviderError;
use crate::models::{AccountId, Payload, PullRequestDetails, ReviewState, SourceId};
use crate::reconcile::{NewRecord, RecordUpdate};

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: Owner,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    id: u64,
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    created_at: DateTime<Utc>,
    user: User,
    #[serde(default)]
    requested_reviewers: Vec<User>,
}

/// Open pull requests in the user's organization repositories
pub struct GithubPrProvider {
    http: HttpClient,
    base_url: String,
}

impl GithubPrProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Organization repositories the user can see, as name -> owner
    fn organization_repos(&self, ctx: &ProviderContext) -> Result<BTreeMap<String, String>, ProviderError> {
        let repos: Vec<Repository> = self
            .http
            .get_json(&format!("{}/user/repos", self.base_url), &ctx.token)?;
        Ok(repos
            .into_iter()
            .filter(|r| r.owner.kind == "Organization")
            .map(|r| (r.name, r.owner.login))
            .collect())
    }
}

impl Provider for GithubPrProvider {
    fn source_id(&self) -> SourceId {
        SourceId::GithubPr
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::FetchPullRequests])
    }

    fn fetch_pull_requests(&self, ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        let me: User = self.http.get_json(&format!("{}/user", self.base_url), &ctx.token)?;
        let repos = self.organization_repos(ctx)?;

        let mut items = Vec::new();
        for (name, owner) in &repos {
            if ctx.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let url = format!(
                "{}/repos/{}/{}/pulls",
                self.base_url,
                urlencoding::encode(owner),
                urlencoding::encode(name)
            );
            let pulls: Vec<PullRequest> = match self.http.get_json(&url, &ctx.token) {
                Ok(pulls) => pulls,
                // Repository went away between listing and fetching
                Err(ProviderError::NotFound(_)) => {
                    warn!("[SYNC] Skipping missing repository {}/{}", owner, name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let repository = format!("{}/{}", owner, name);
            items.extend(
                pulls
                    .into_iter()
                    .filter_map(|pr| to_item(pr, me.id, &repository, &ctx.account_id)),
            );
        }

        debug!(
            "[SYNC] GitHub returned {} relevant pull requests across {} repositories",
            items.len(),
            repos.len()
        );
        Ok(items)
    }
}

/// The user's relation to a pull request, if any
fn review_state(pr: &PullRequest, user_id: u64) -> Option<ReviewState> {
    if pr.user.id == user_id {
        Some(ReviewState::Authored)
    } else if pr.requested_reviewers.iter().any(|r| r.id == user_id) {
        Some(ReviewState::ReviewRequested)
    } else {
        None
    }
}

fn to_item(pr: PullRequest, user_id: u64, repository: &str, account_id: &AccountId) -> Option<FetchedItem> {
    let review_state = review_state(&pr, user_id)?;
    let details = PullRequestDetails {
        repository: repository.to_string(),
        number: pr.number,
        review_state,
        opened_at: pr.created_at,
    };
    let body = pr.body.unwrap_or_default();

    let new = NewRecord::new(account_id.clone(), pr.title.clone(), Payload::PullRequest(details.clone()))
        .with_body(body.clone())
        .with_deeplink(pr.html_url.clone())
        .with_section(DEFAULT_SECTION)
        .with_created_at(pr.created_at);
    // An open pull request is never complete
    let update = RecordUpdate {
        title: Some(pr.title),
        body: Some(body),
        deeplink: Some(pr.html_url),
        completed: Some(false),
        payload: Some(Payload::PullRequest(details)),
        ..Default::default()
    };
    Some(FetchedItem::new(pr.id.to_string(), new, update))
}
