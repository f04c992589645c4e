//! HTTP-backed implementations of the issue and billing capabilities.

use async_trait::async_trait;
use chrono::NaiveDate;
use harvester_api::{
    ApiError, HarvestClient, HarvestConfig, JiraClient, JiraConfig, JiraIssue,
    ProjectAssignment as ApiProjectAssignment, TimeEntry as ApiTimeEntry, Url,
};
use log::debug;
use std::sync::Arc;

use crate::config::{HarvestSettings, JiraSettings};
use crate::error::{HarvesterError, Result, Service};
use crate::sources::{
    BillingSource, Issue, IssueSource, ProjectAssignment, TaskAssignment, TimeEntry,
    TimeEntryRef,
};

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_text(value: &str, limit: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    if limit <= 1 {
        return "…".to_string();
    }
    let mut truncated: String = trimmed.chars().take(limit - 1).collect();
    truncated.push('…');
    truncated
}

/// Shortens remote error text for logs and hides anything that looks like a credential.
pub fn redact_log_details(value: &str) -> String {
    let collapsed = collapse_whitespace(value);
    let category = collapsed
        .split(':')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .unwrap_or("error");
    let lowered = collapsed.to_lowercase();
    let has_sensitive_hint = [
        "token",
        "authorization",
        "bearer",
        "password",
        "harvest-account-id",
        "set-cookie",
    ]
    .iter()
    .any(|hint| lowered.contains(hint));

    if has_sensitive_hint {
        return format!(
            "{}: <redacted-sensitive-details>",
            truncate_text(category, 64)
        );
    }

    truncate_text(&collapsed, 180)
}

fn upstream(service: Service) -> impl Fn(ApiError) -> HarvesterError {
    move |err| HarvesterError::upstream(service, err.to_string())
}

fn convert_issue(issue: JiraIssue, config: &JiraConfig) -> Issue {
    Issue {
        url: Some(config.browse_url(&issue.key)),
        summary: issue.summary().to_string(),
        key: issue.key,
    }
}

fn convert_entry(entry: ApiTimeEntry) -> TimeEntry {
    TimeEntry {
        hours: entry.hours(),
        is_manager: entry.is_project_manager(),
        id: entry.id,
        project_id: entry.project.id,
        project_code: entry.project.code.unwrap_or_default(),
        task_id: entry.task.id,
        is_running: entry.is_running,
        spent_date: entry.spent_date,
    }
}

fn convert_assignment(assignment: ApiProjectAssignment) -> ProjectAssignment {
    ProjectAssignment {
        project_id: assignment.project.id,
        project_code: assignment.project.code.unwrap_or_default(),
        project_name: assignment.project.name,
        task_assignments: assignment
            .task_assignments
            .into_iter()
            .map(|task| TaskAssignment {
                task_id: task.task.id,
                task_name: task.task.name,
            })
            .collect(),
    }
}

/// Jira-backed [`IssueSource`].
pub struct JiraIssueSource {
    client: JiraClient,
}

impl JiraIssueSource {
    pub fn new(client: JiraClient) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &JiraSettings) -> Result<Self> {
        let config = JiraConfig::new(&settings.url, &settings.user, &settings.pass);
        JiraClient::new(config)
            .map(Self::new)
            .map_err(upstream(Service::Issues))
    }
}

#[async_trait]
impl IssueSource for JiraIssueSource {
    async fn list_active_issues(&self) -> Result<Vec<Issue>> {
        let issues = self
            .client
            .list_active_issues()
            .await
            .map_err(upstream(Service::Issues))?;
        let config = self.client.config();
        Ok(issues
            .into_iter()
            .map(|issue| convert_issue(issue, config))
            .collect())
    }
}

/// Harvest-backed [`BillingSource`].
pub struct HarvestBillingSource {
    client: HarvestClient,
}

impl HarvestBillingSource {
    pub fn new(client: HarvestClient) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &HarvestSettings) -> Result<Self> {
        let config = HarvestConfig::new(&settings.account_id, &settings.token);
        HarvestClient::new(config)
            .map(Self::new)
            .map_err(upstream(Service::Billing))
    }
}

#[async_trait]
impl BillingSource for HarvestBillingSource {
    async fn company_base_url(&self) -> Result<Url> {
        let company = self
            .client
            .get_company()
            .await
            .map_err(upstream(Service::Billing))?;
        Url::parse(&company.base_uri).map_err(|err| {
            HarvesterError::upstream(
                Service::Billing,
                format!("invalid company url {:?}: {}", company.base_uri, err),
            )
        })
    }

    async fn list_running_entries(&self) -> Result<Vec<TimeEntry>> {
        let entries = self
            .client
            .list_running_entries()
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(entries.into_iter().map(convert_entry).collect())
    }

    async fn list_entries_since(&self, from: NaiveDate) -> Result<Vec<TimeEntry>> {
        let entries = self
            .client
            .list_time_entries(&harvester_api::TimeEntryQuery::since(from))
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(entries.into_iter().map(convert_entry).collect())
    }

    async fn list_my_project_assignments(&self) -> Result<Vec<ProjectAssignment>> {
        let assignments = self
            .client
            .list_my_project_assignments()
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(assignments.into_iter().map(convert_assignment).collect())
    }

    async fn start_timer(
        &self,
        project_id: u64,
        task_id: u64,
        date: NaiveDate,
    ) -> Result<TimeEntryRef> {
        let entry = self
            .client
            .start_timer(project_id, task_id, date)
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(TimeEntryRef { id: entry.id })
    }

    async fn stop_timer(&self, entry_id: u64) -> Result<()> {
        self.client
            .stop_timer(entry_id)
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(())
    }

    async fn create_entry(
        &self,
        project_id: u64,
        task_id: u64,
        hours: f64,
        date: NaiveDate,
    ) -> Result<TimeEntryRef> {
        let entry = self
            .client
            .create_entry(project_id, task_id, hours, date)
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(TimeEntryRef { id: entry.id })
    }

    async fn update_entry_hours(&self, entry_id: u64, hours: f64) -> Result<()> {
        self.client
            .update_entry_hours(entry_id, hours)
            .await
            .map_err(upstream(Service::Billing))?;
        Ok(())
    }
}

/// Builds remote handles from settings. `Ok(None)` means the service is not configured.
pub trait SourceFactory: Send + Sync {
    fn issues(&self, settings: &JiraSettings) -> Result<Option<Arc<dyn IssueSource>>>;

    fn billing(&self, settings: &HarvestSettings) -> Result<Option<Arc<dyn BillingSource>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSourceFactory;

impl SourceFactory for HttpSourceFactory {
    fn issues(&self, settings: &JiraSettings) -> Result<Option<Arc<dyn IssueSource>>> {
        if !settings.is_configured() {
            debug!("Jira not configured");
            return Ok(None);
        }
        let source: Arc<dyn IssueSource> = Arc::new(JiraIssueSource::from_settings(settings)?);
        Ok(Some(source))
    }

    fn billing(&self, settings: &HarvestSettings) -> Result<Option<Arc<dyn BillingSource>>> {
        if !settings.is_configured() {
            debug!("Harvest not configured");
            return Ok(None);
        }
        let source: Arc<dyn BillingSource> =
            Arc::new(HarvestBillingSource::from_settings(settings)?);
        Ok(Some(source))
    }
}
