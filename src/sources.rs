//! Capabilities the core needs from the issue tracker and the billing service.
//!
//! Both services are consumed through narrow async traits so that the
//! reconciliation, timer and backfill logic never depend on a transport.
//! Handles are bundled in [`Sources`] and replaced wholesale when credentials
//! change; calls already running against an old handle finish on their own.

use async_trait::async_trait;
use chrono::NaiveDate;
use harvester_api::Url;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HarvesterError, Result, Service};

/// Name of the billing task that represents billable development work.
pub const CODING_TASK_NAME: &str = "Coding";
/// Bound for calls made while the operator is waiting.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound for the bulk calls made by the backfill job.
pub const BULK_TIMEOUT: Duration = Duration::from_secs(60);

/// Issue assigned to the operator, as reported by the issue tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    pub url: Option<String>,
}

/// A billing time entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeEntry {
    pub id: u64,
    pub project_id: u64,
    pub project_code: String,
    pub task_id: u64,
    pub is_running: bool,
    pub hours: f64,
    pub is_manager: bool,
    pub spent_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskAssignment {
    pub task_id: u64,
    pub task_name: String,
}

/// A billing project the operator may log time against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectAssignment {
    pub project_id: u64,
    pub project_code: String,
    pub project_name: String,
    pub task_assignments: Vec<TaskAssignment>,
}

impl ProjectAssignment {
    /// The task used for tracked development time.
    pub fn coding_task(&self) -> Option<&TaskAssignment> {
        self.task_assignments
            .iter()
            .find(|task| task.task_name == CODING_TASK_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeEntryRef {
    pub id: u64,
}

/// Live billing data attached to a timer: the project plus its running remote timer, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingProject {
    pub assignment: ProjectAssignment,
    pub running_entry: Option<TimeEntryRef>,
}

/// Pairs each assignment with the running entry on the same project.
pub fn join_running(
    assignments: Vec<ProjectAssignment>,
    running: &[TimeEntry],
) -> Vec<BillingProject> {
    assignments
        .into_iter()
        .map(|assignment| {
            let running_entry = running
                .iter()
                .find(|entry| entry.is_running && entry.project_id == assignment.project_id)
                .map(|entry| TimeEntryRef { id: entry.id });
            BillingProject {
                assignment,
                running_entry,
            }
        })
        .collect()
}

#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Unresolved issues currently assigned to the operator.
    async fn list_active_issues(&self) -> Result<Vec<Issue>>;
}

#[async_trait]
pub trait BillingSource: Send + Sync {
    async fn company_base_url(&self) -> Result<Url>;

    async fn list_running_entries(&self) -> Result<Vec<TimeEntry>>;

    /// Entries with a spent date on or after `from`.
    async fn list_entries_since(&self, from: NaiveDate) -> Result<Vec<TimeEntry>>;

    async fn list_my_project_assignments(&self) -> Result<Vec<ProjectAssignment>>;

    async fn start_timer(
        &self,
        project_id: u64,
        task_id: u64,
        date: NaiveDate,
    ) -> Result<TimeEntryRef>;

    async fn stop_timer(&self, entry_id: u64) -> Result<()>;

    async fn create_entry(
        &self,
        project_id: u64,
        task_id: u64,
        hours: f64,
        date: NaiveDate,
    ) -> Result<TimeEntryRef>;

    async fn update_entry_hours(&self, entry_id: u64, hours: f64) -> Result<()>;
}

/// Current remote client handles; either side may be unconfigured.
#[derive(Clone, Default)]
pub struct Sources {
    pub issues: Option<Arc<dyn IssueSource>>,
    pub billing: Option<Arc<dyn BillingSource>>,
}

impl Sources {
    pub fn new(
        issues: Option<Arc<dyn IssueSource>>,
        billing: Option<Arc<dyn BillingSource>>,
    ) -> Self {
        Self { issues, billing }
    }
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sources")
            .field("issues", &self.issues.is_some())
            .field("billing", &self.billing.is_some())
            .finish()
    }
}

/// Runs a remote call with an upper time bound, reporting expiry as an upstream failure.
pub async fn bounded<T, F>(service: Service, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(HarvesterError::upstream(
            service,
            format!("timed out after {}s", limit.as_secs()),
        )),
    }
}
