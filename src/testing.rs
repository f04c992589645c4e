//! In-memory fakes of the remote and storage capabilities, shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use harvester_api::Url;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clients::SourceFactory;
use crate::config::{HarvestSettings, JiraSettings, Settings};
use crate::error::{HarvesterError, Result, Service};
use crate::presentation::Presenter;
use crate::scheduler::Snapshot;
use crate::sources::{
    BillingProject, BillingSource, Issue, IssueSource, ProjectAssignment, TaskAssignment,
    TimeEntry, TimeEntryRef,
};
use crate::store::{
    MemoryStore, Persistence, RecordFilter, StoreError, StoreResult, StoredTimerRecord,
};

/// Local wall-clock time converted to UTC, so tests read the same in every timezone.
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .expect("valid local timestamp")
        .with_timezone(&Utc)
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// Assignment whose task ids are `100 + position`.
pub fn assignment(project_id: u64, code: &str, tasks: &[&str]) -> ProjectAssignment {
    ProjectAssignment {
        project_id,
        project_code: code.to_string(),
        project_name: format!("{code} project"),
        task_assignments: tasks
            .iter()
            .enumerate()
            .map(|(index, name)| TaskAssignment {
                task_id: index as u64 + 100,
                task_name: name.to_string(),
            })
            .collect(),
    }
}

pub fn billing_project(
    project_id: u64,
    code: &str,
    tasks: &[&str],
    running_entry: Option<u64>,
) -> BillingProject {
    BillingProject {
        assignment: assignment(project_id, code, tasks),
        running_entry: running_entry.map(|id| TimeEntryRef { id }),
    }
}

pub fn issue(key: &str) -> Issue {
    Issue {
        key: key.to_string(),
        summary: format!("Work on {key}"),
        url: None,
    }
}

pub fn closed_record(key: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> StoredTimerRecord {
    let mut record = StoredTimerRecord::open(key, start);
    record.stopped_at = Some(end);
    record
}

#[derive(Default)]
pub struct FakeIssues {
    issues: Mutex<Vec<Issue>>,
    failure: Mutex<Option<String>>,
    lists: AtomicUsize,
}

impl FakeIssues {
    pub fn with_keys(keys: &[&str]) -> Self {
        let fake = Self::default();
        *fake.issues.lock().expect("issues lock") = keys.iter().map(|key| issue(key)).collect();
        fake
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().expect("failure lock") = Some(message.to_string());
    }

    /// How many times the issue list was fetched.
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueSource for FakeIssues {
    async fn list_active_issues(&self) -> Result<Vec<Issue>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().expect("failure lock").clone() {
            return Err(HarvesterError::upstream(Service::Issues, message));
        }
        Ok(self.issues.lock().expect("issues lock").clone())
    }
}

/// Billing fake that records every mutating call as a short string.
#[derive(Default)]
pub struct FakeBilling {
    assignments: Mutex<Vec<ProjectAssignment>>,
    entries: Mutex<Vec<TimeEntry>>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    company_lookups: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeBilling {
    pub fn with_assignments(assignments: Vec<ProjectAssignment>) -> Self {
        let fake = Self::default();
        *fake.assignments.lock().expect("assignments lock") = assignments;
        fake
    }

    pub fn set_entries(&self, entries: Vec<TimeEntry>) {
        *self.entries.lock().expect("entries lock") = entries;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().expect("failure lock") = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().expect("failure lock") = None;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn company_lookups(&self) -> usize {
        self.company_lookups.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().expect("failure lock").clone() {
            Some(message) => Err(HarvesterError::upstream(Service::Billing, message)),
            None => Ok(()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn next_ref(&self) -> TimeEntryRef {
        TimeEntryRef {
            id: 1000 + self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
        }
    }
}

#[async_trait]
impl BillingSource for FakeBilling {
    async fn company_base_url(&self) -> Result<Url> {
        self.check()?;
        self.company_lookups.fetch_add(1, Ordering::SeqCst);
        Url::parse("https://acme.harvestapp.com")
            .map_err(|err| HarvesterError::upstream(Service::Billing, err.to_string()))
    }

    async fn list_running_entries(&self) -> Result<Vec<TimeEntry>> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .expect("entries lock")
            .iter()
            .filter(|entry| entry.is_running)
            .cloned()
            .collect())
    }

    async fn list_entries_since(&self, from: NaiveDate) -> Result<Vec<TimeEntry>> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .expect("entries lock")
            .iter()
            .filter(|entry| entry.spent_date >= from)
            .cloned()
            .collect())
    }

    async fn list_my_project_assignments(&self) -> Result<Vec<ProjectAssignment>> {
        self.check()?;
        Ok(self.assignments.lock().expect("assignments lock").clone())
    }

    async fn start_timer(
        &self,
        project_id: u64,
        task_id: u64,
        _date: NaiveDate,
    ) -> Result<TimeEntryRef> {
        self.check()?;
        self.record(format!("start_timer({project_id},{task_id})"));
        Ok(self.next_ref())
    }

    async fn stop_timer(&self, entry_id: u64) -> Result<()> {
        self.check()?;
        self.record(format!("stop_timer({entry_id})"));
        Ok(())
    }

    async fn create_entry(
        &self,
        project_id: u64,
        task_id: u64,
        hours: f64,
        date: NaiveDate,
    ) -> Result<TimeEntryRef> {
        self.check()?;
        self.record(format!("create_entry({project_id},{task_id},{hours:.2},{date})"));
        Ok(self.next_ref())
    }

    async fn update_entry_hours(&self, entry_id: u64, hours: f64) -> Result<()> {
        self.check()?;
        self.record(format!("update_entry_hours({entry_id},{hours:.2})"));
        Ok(())
    }
}

/// Memory store that can be switched into a failing mode and counts writes.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("disk unplugged".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Persistence for FailingStore {
    async fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save_settings(settings).await
    }

    async fn load_settings(&self) -> StoreResult<Option<Settings>> {
        self.check()?;
        self.inner.load_settings().await
    }

    async fn save_timer_record(&self, record: &StoredTimerRecord) -> StoreResult<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save_timer_record(record).await
    }

    async fn list_timer_records(
        &self,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<StoredTimerRecord>> {
        self.check()?;
        self.inner.list_timer_records(filter).await
    }

    async fn delete_timer_record(&self, id: &str) -> StoreResult<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_timer_record(id).await
    }
}

/// Hands out the same fakes for any settings and counts how often it was asked.
pub struct StaticFactory {
    issues: Arc<FakeIssues>,
    billing: Arc<FakeBilling>,
    builds: AtomicUsize,
}

impl StaticFactory {
    pub fn new(issues: Arc<FakeIssues>, billing: Arc<FakeBilling>) -> Self {
        Self {
            issues,
            billing,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl SourceFactory for StaticFactory {
    fn issues(&self, _settings: &JiraSettings) -> Result<Option<Arc<dyn IssueSource>>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let source: Arc<dyn IssueSource> = self.issues.clone();
        Ok(Some(source))
    }

    fn billing(&self, _settings: &HarvestSettings) -> Result<Option<Arc<dyn BillingSource>>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let source: Arc<dyn BillingSource> = self.billing.clone();
        Ok(Some(source))
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    snapshots: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl RecordingPresenter {
    pub fn snapshots(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }
}

impl Presenter for RecordingPresenter {
    fn show_snapshot(&self, _snapshot: &Snapshot) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }

    fn show_error(&self, error: &HarvesterError) {
        self.errors.lock().expect("errors lock").push(error.to_string());
    }
}
