//! Jira adapter

use chrono::{NaiveDate, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    Capability, CapabilitySet, FetchedItem, HttpClient, Provider, ProviderContext, TaskChanges,
    DEFAULT_SECTION,
};
use crate::error::ProviderError;
use crate::models::{AccountId, CanonicalRecord, Payload, SourceId, TaskDetails};
use crate::reconcile::{NewRecord, RecordUpdate};

/// Issues assigned to the caller that are still open
const ASSIGNED_OPEN_JQL: &str = "assignee=currentuser() AND status != Done";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    id: String,
    key: String,
    fields: IssueFields,
}

#[derive(Debug, Default, Deserialize)]
struct IssueFields {
    #[serde(default)]
    summary: String,
    description: Option<String>,
    priority: Option<PriorityRef>,
    duedate: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PriorityRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TransitionList {
    #[serde(default)]
    transitions: Vec<Transition>,
}

#[derive(Debug, Deserialize)]
struct Transition {
    id: String,
}

#[derive(Debug, Default, Serialize)]
struct FieldChanges<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duedate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<PriorityRef>,
}

/// Jira Cloud issues, addressed through the caller's cloud id (`ctx.site`)
pub struct JiraProvider {
    http: HttpClient,
    base_url: String,
}

impl JiraProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn site_url(&self, ctx: &ProviderContext) -> Result<String, ProviderError> {
        let site = ctx.site.as_deref().ok_or_else(|| {
            ProviderError::MissingCredential(format!("jira site for account {}", ctx.account_id))
        })?;
        Ok(format!("{}/{}", self.base_url, site))
    }

    fn transitions_url(&self, ctx: &ProviderContext, issue_id: &str) -> Result<String, ProviderError> {
        Ok(format!(
            "{}/rest/api/3/issue/{}/transitions",
            self.site_url(ctx)?,
            urlencoding::encode(issue_id)
        ))
    }
}

impl Provider for JiraProvider {
    fn source_id(&self) -> SourceId {
        SourceId::Jira
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::FetchTasks, Capability::ModifyTask, Capability::MarkDone])
    }

    fn fetch_tasks(&self, ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        let url = format!(
            "{}/rest/api/2/search?jql={}",
            self.site_url(ctx)?,
            urlencoding::encode(ASSIGNED_OPEN_JQL)
        );
        let response: SearchResponse = self.http.get_json(&url, &ctx.token)?;
        debug!(
            "[SYNC] Jira returned {} open issues for {}",
            response.issues.len(),
            ctx.account_id
        );
        Ok(response
            .issues
            .into_iter()
            .map(|issue| to_item(issue, &ctx.account_id))
            .collect())
    }

    fn modify_task(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
        changes: &TaskChanges,
    ) -> Result<(), ProviderError> {
        let fields = FieldChanges {
            summary: changes.title.as_deref(),
            description: changes.body.as_deref(),
            duedate: changes.due_date.map(|d| d.format("%Y-%m-%d").to_string()),
            priority: changes.priority_id.clone().map(|id| PriorityRef { id }),
        };
        let url = format!(
            "{}/rest/api/2/issue/{}",
            self.site_url(ctx)?,
            urlencoding::encode(external_id)
        );
        self.http.put_json(&url, &ctx.token, &json!({ "fields": fields }))
    }

    /// Applies the issue's last available transition
    fn mark_done(&self, ctx: &ProviderContext, record: &CanonicalRecord) -> Result<(), ProviderError> {
        let url = self.transitions_url(ctx, &record.external_id)?;
        let list: TransitionList = self.http.get_json(&url, &ctx.token)?;
        let last = list
            .transitions
            .last()
            .ok_or_else(|| ProviderError::NotFound(format!("final transition for {}", record.external_id)))?;
        self.http.post_json_no_content(
            &url,
            &ctx.token,
            &json!({ "transition": { "id": last.id } }),
        )
    }
}

fn to_item(issue: Issue, account_id: &AccountId) -> FetchedItem {
    let due_date = issue
        .fields
        .duedate
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| Utc.from_utc_datetime(&d));
    let details = TaskDetails {
        priority_id: issue.fields.priority.map(|p| p.id),
        due_date,
    };
    let body = issue.fields.description.unwrap_or_default();
    let title = if issue.fields.summary.is_empty() {
        issue.key.clone()
    } else {
        issue.fields.summary
    };

    let new = NewRecord::new(account_id.clone(), title.clone(), Payload::Task(details.clone()))
        .with_body(body.clone())
        .with_section(DEFAULT_SECTION);
    let update = RecordUpdate {
        title: Some(title),
        body: Some(body),
        // Listed again means open again, even after an earlier sync completed it
        completed: Some(false),
        deleted: Some(false),
        payload: Some(Payload::Task(details)),
        ..Default::default()
    };
    FetchedItem::new(issue.id, new, update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;
    use crate::providers::AccessToken;
    use crate::models::{RecordKey, SourceId};
    use crate::reconcile::Reconciler;
    use crate::storage::InMemoryRecordStore;
    use crate::sync::CancelToken;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_issue_to_item() {
        let response: SearchResponse = serde_json::from_str(
            r#"{"issues": [{
                "id": "10001",
                "key": "OPS-7",
                "fields": {
                    "summary": "Rotate keys",
                    "description": "Before Friday",
                    "priority": {"id": "2", "name": "High"},
                    "duedate": "2024-03-01"
                }
            }]}"#,
        )
        .unwrap();
        let issue = response.issues.into_iter().next().unwrap();
        let item = to_item(issue, &AccountId::new("site-1"));

        assert_eq!(item.external_id, "10001");
        let task = item.new.payload.as_task().unwrap();
        assert_eq!(task.priority_id.as_deref(), Some("2"));
        assert_eq!(task.due_date.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(item.update.title.as_deref(), Some("Rotate keys"));
        assert_eq!(item.new.body, "Before Friday");
    }

    #[test]
    fn test_untitled_issue_uses_key() {
        let issue = Issue {
            id: "1".to_string(),
            key: "OPS-1".to_string(),
            fields: IssueFields::default(),
        };
        let item = to_item(issue, &AccountId::new("site-1"));
        assert_eq!(item.new.title, "OPS-1");
        assert_eq!(item.new.payload.as_task().unwrap().priority_id, None);
    }

    #[test]
    fn test_missing_site_is_credential_error() {
        let provider = JiraProvider::new(HttpClient::new(Duration::from_secs(1)), "https://jira.example");
        let ctx = ProviderContext {
            user_id: UserId::new("u1"),
            account_id: AccountId::new("site-1"),
            token: AccessToken::new("t"),
            site: None,
            cancel: CancelToken::new(),
        };
        assert!(provider.fetch_tasks(&ctx).unwrap_err().is_bad_credential());
        assert!(provider.create_task(&ctx, &Default::default()).is_err());
    }

    #[test]
    fn test_field_changes_skip_unset() {
        let fields = FieldChanges {
            priority: Some(PriorityRef { id: "3".to_string() }),
            ..Default::default()
        };
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json, json!({"priority": {"id": "3"}}));
    }

    #[test]
    fn test_relisted_issue_reopens() {
        let reconciler = Reconciler::new(Arc::new(InMemoryRecordStore::new()));
        let (user, account) = (UserId::new("u1"), AccountId::new("site-1"));
        let key = RecordKey::new(user.clone(), "1", SourceId::Jira);
        let issue = || Issue {
            id: "1".to_string(),
            key: "OPS-1".to_string(),
            fields: IssueFields::default(),
        };

        let item = to_item(issue(), &account);
        reconciler.reconcile(&key, Some(&item.new), &item.update, &[]).unwrap();
        let completed = reconciler
            .complete_missing(&user, &SourceId::Jira, &account, &HashSet::new())
            .unwrap();
        assert_eq!(completed, 1);

        let item = to_item(issue(), &account);
        let reopened = reconciler
            .reconcile(&key, Some(&item.new), &item.update, &[])
            .unwrap()
            .record;
        assert!(!reopened.completed);
        assert!(reopened.completed_at.is_none());
    }
}
