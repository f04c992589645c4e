//! Timer state machine: the registry of task timers and its start/stop transitions.
//!
//! At most one timer is running at any time. Which one is derived by scanning
//! the store; there is no separate "current timer" field to drift out of sync.

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{HarvesterError, Result, Service};
use crate::sources::{bounded, BillingProject, BillingSource, Issue, INTERACTIVE_TIMEOUT};
use crate::store::{Persistence, RecordFilter, StoredTimerRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TimerStatus {
    Idle,
    Running,
}

/// One trackable unit of work plus the live data fetched for it this cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskTimer {
    pub key: String,
    /// Latest local run for the key; open while the timer is running.
    pub run: Option<StoredTimerRecord>,
    pub issue: Option<Issue>,
    pub billing: Option<BillingProject>,
}

impl TaskTimer {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            run: None,
            issue: None,
            billing: None,
        }
    }

    pub fn status(&self) -> TimerStatus {
        if self.is_running() {
            TimerStatus::Running
        } else {
            TimerStatus::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().map(StoredTimerRecord::is_open).unwrap_or(false)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.run.as_ref().map(|run| run.started_at)
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.run.as_ref().and_then(|run| run.stopped_at)
    }

    /// Elapsed time of the open run, `None` when idle.
    pub fn running_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.run
            .as_ref()
            .filter(|run| run.is_open())
            .map(|run| run.duration(now))
    }

    pub fn summary(&self) -> Option<&str> {
        self.issue
            .as_ref()
            .map(|issue| issue.summary.as_str())
            .or_else(|| {
                self.billing
                    .as_ref()
                    .map(|billing| billing.assignment.project_name.as_str())
            })
    }
}

/// Formats seconds as `1h 05m` or `12m`.
pub fn format_elapsed(elapsed: u64) -> String {
    let hours = elapsed / 3600;
    let minutes = (elapsed % 3600) / 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// Calendar day of an instant in the operator's timezone.
pub fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Ordered collection of timers keyed by `key`.
#[derive(Clone, Debug, Default)]
pub struct TimerStore {
    timers: Vec<TaskTimer>,
}

impl TimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store, sorting by key and keeping the first timer seen per key.
    pub fn from_timers(mut timers: Vec<TaskTimer>) -> Self {
        timers.sort_by(|a, b| a.key.cmp(&b.key));
        timers.dedup_by(|later, earlier| later.key == earlier.key);
        Self { timers }
    }

    /// Swaps in a freshly reconciled set of timers.
    pub fn replace(&mut self, fresh: TimerStore) {
        *self = fresh;
    }

    pub fn get(&self, key: &str) -> Option<&TaskTimer> {
        self.index_of(key).and_then(|index| self.timers.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskTimer> {
        self.timers.iter()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// The running timer, if any.
    pub fn running(&self) -> Option<&TaskTimer> {
        self.timers.iter().find(|timer| timer.is_running())
    }

    pub fn snapshot(&self) -> Vec<TaskTimer> {
        self.timers.clone()
    }

    fn index_of(&self, key: &str) -> Option<usize> {
        self.timers
            .binary_search_by(|timer| timer.key.as_str().cmp(key))
            .ok()
    }

    fn timer_mut(&mut self, key: &str) -> Result<&mut TaskTimer> {
        let index = self.index_of(key).ok_or_else(|| HarvesterError::UnknownTimer {
            key: key.to_string(),
        })?;
        self.timers
            .get_mut(index)
            .ok_or_else(|| HarvesterError::UnknownTimer {
                key: key.to_string(),
            })
    }

    /// Starts tracking `key`, stopping whichever other timer is running first.
    ///
    /// The billing project's "Coding" task is resolved before anything is
    /// written, and a local run is rolled back when the remote start fails, so
    /// a failed start leaves the key idle. An open run already persisted for
    /// the key is adopted rather than duplicated.
    pub async fn start(
        &mut self,
        key: &str,
        persistence: &dyn Persistence,
        billing: Option<&dyn BillingSource>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let target = self.get(key).ok_or_else(|| HarvesterError::UnknownTimer {
            key: key.to_string(),
        })?;
        if target.is_running() {
            debug!("Timer {} already running", key);
            return Ok(());
        }
        let remote_plan = match (&target.billing, billing) {
            (Some(project), Some(_)) if project.running_entry.is_none() => {
                let task = project
                    .assignment
                    .coding_task()
                    .map(|task| task.task_id)
                    .ok_or_else(|| HarvesterError::NoCodingTask {
                        key: key.to_string(),
                    });
                Some((project.assignment.project_id, task))
            }
            _ => None,
        };

        let others: Vec<String> = self
            .timers
            .iter()
            .filter(|timer| timer.is_running() && timer.key != key)
            .map(|timer| timer.key.clone())
            .collect();
        for other in others {
            self.stop(&other, persistence, billing, now).await?;
        }

        let remote_plan = match remote_plan {
            Some((project_id, task)) => Some((project_id, task?)),
            None => None,
        };

        let existing = persistence
            .list_timer_records(&RecordFilter::for_key(key))
            .await?
            .into_iter()
            .filter(StoredTimerRecord::is_open)
            .last();
        let adopted = existing.is_some();
        let run = match existing {
            Some(open) => {
                warn!(
                    "Adopting open run for {} started at {} instead of starting a duplicate",
                    key, open.started_at
                );
                open
            }
            None => {
                let run = StoredTimerRecord::open(key, now);
                persistence.save_timer_record(&run).await?;
                run
            }
        };

        let mut started_entry = None;
        if let (Some((project_id, task_id)), Some(billing)) = (remote_plan, billing) {
            let call = billing.start_timer(project_id, task_id, local_day(now));
            match bounded(Service::Billing, INTERACTIVE_TIMEOUT, call).await {
                Ok(entry) => started_entry = Some(entry),
                Err(err) => {
                    if !adopted {
                        if let Err(cleanup) = persistence.delete_timer_record(&run.id).await {
                            warn!("Failed to roll back run for {}: {}", key, cleanup);
                        }
                    }
                    return Err(err);
                }
            }
        }

        let timer = self.timer_mut(key)?;
        if let (Some(entry), Some(project)) = (started_entry, timer.billing.as_mut()) {
            project.running_entry = Some(entry);
        }
        timer.run = Some(run);
        info!("Started timer {}", key);
        Ok(())
    }

    /// Stops `key` if it is running; a no-op otherwise.
    ///
    /// The stop time is persisted before the billing timer is stopped. A
    /// billing failure is returned while the local timer stays stopped.
    pub async fn stop(
        &mut self,
        key: &str,
        persistence: &dyn Persistence,
        billing: Option<&dyn BillingSource>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let timer = self.get(key).ok_or_else(|| HarvesterError::UnknownTimer {
            key: key.to_string(),
        })?;
        let Some(mut closed) = timer.run.clone().filter(StoredTimerRecord::is_open) else {
            return Ok(());
        };
        closed.stopped_at = Some(now.max(closed.started_at));
        persistence.save_timer_record(&closed).await?;

        let timer = self.timer_mut(key)?;
        timer.run = Some(closed);
        info!("Stopped timer {}", key);

        let remote_entry = timer
            .billing
            .as_ref()
            .and_then(|project| project.running_entry);
        if let (Some(entry), Some(billing)) = (remote_entry, billing) {
            bounded(
                Service::Billing,
                INTERACTIVE_TIMEOUT,
                billing.stop_timer(entry.id),
            )
            .await?;
            if let Some(project) = self.timer_mut(key)?.billing.as_mut() {
                project.running_entry = None;
            }
        }
        Ok(())
    }

    /// Best-effort stop of every running timer; failures are returned per key.
    pub async fn stop_all(
        &mut self,
        persistence: &dyn Persistence,
        billing: Option<&dyn BillingSource>,
        now: DateTime<Utc>,
    ) -> Vec<(String, HarvesterError)> {
        let running: Vec<String> = self
            .timers
            .iter()
            .filter(|timer| timer.is_running())
            .map(|timer| timer.key.clone())
            .collect();
        let mut failures = Vec::new();
        for key in running {
            if let Err(err) = self.stop(&key, persistence, billing, now).await {
                failures.push((key, err));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{billing_project, utc, FakeBilling, FailingStore};

    fn store_with(keys: &[&str]) -> TimerStore {
        TimerStore::from_timers(keys.iter().map(|key| TaskTimer::new(*key)).collect())
    }

    fn running_count(store: &TimerStore) -> usize {
        store.iter().filter(|timer| timer.is_running()).count()
    }

    #[test]
    fn from_timers_sorts_and_dedups_keys() {
        let store = store_with(&["C", "A", "B", "A"]);
        let keys: Vec<_> = store.iter().map(|timer| timer.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert!(store.get("B").is_some());
        assert!(store.get("D").is_none());
    }

    #[test]
    fn format_elapsed_matches_display_style() {
        assert_eq!(format_elapsed(59), "0m");
        assert_eq!(format_elapsed(12 * 60), "12m");
        assert_eq!(format_elapsed(3600 + 5 * 60), "1h 05m");
    }

    #[tokio::test]
    async fn start_persists_open_run_and_marks_running() {
        let persistence = MemoryStore::new();
        let mut store = store_with(&["A"]);
        let now = utc(2024, 5, 6, 9, 0);

        store.start("A", &persistence, None, now).await.expect("start");

        let timer = store.get("A").expect("timer");
        assert_eq!(timer.status(), TimerStatus::Running);
        assert_eq!(timer.started_at(), Some(now));
        let records = persistence
            .list_timer_records(&RecordFilter::for_key("A"))
            .await
            .expect("list");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_open());
    }

    #[tokio::test]
    async fn starting_another_timer_stops_the_running_one_first() {
        let persistence = MemoryStore::new();
        let mut store = store_with(&["PROJ-1", "PROJ-2"]);
        store
            .start("PROJ-2", &persistence, None, utc(2024, 5, 6, 9, 0))
            .await
            .expect("start PROJ-2");
        store
            .start("PROJ-1", &persistence, None, utc(2024, 5, 6, 10, 0))
            .await
            .expect("start PROJ-1");

        assert_eq!(running_count(&store), 1);
        assert_eq!(store.running().map(|timer| timer.key.as_str()), Some("PROJ-1"));
        let previous = persistence
            .list_timer_records(&RecordFilter::for_key("PROJ-2"))
            .await
            .expect("list");
        assert_eq!(previous[0].stopped_at, Some(utc(2024, 5, 6, 10, 0)));
    }

    #[tokio::test]
    async fn missing_coding_task_fails_start_and_leaves_previous_stopped() {
        let persistence = MemoryStore::new();
        let billing = FakeBilling::default();
        let mut timers = vec![TaskTimer::new("PROJ-1"), TaskTimer::new("PROJ-2")];
        timers[0].billing = Some(billing_project(1, "PROJ-1", &["Design"], None));
        let mut store = TimerStore::from_timers(timers);

        store
            .start("PROJ-2", &persistence, Some(&billing), utc(2024, 5, 6, 9, 0))
            .await
            .expect("start PROJ-2");
        let err = store
            .start("PROJ-1", &persistence, Some(&billing), utc(2024, 5, 6, 10, 0))
            .await
            .expect_err("no coding task");

        assert!(matches!(err, HarvesterError::NoCodingTask { ref key } if key == "PROJ-1"));
        assert_eq!(running_count(&store), 0);
        assert_eq!(
            store.get("PROJ-2").and_then(TaskTimer::stopped_at),
            Some(utc(2024, 5, 6, 10, 0))
        );
        let proj1 = persistence
            .list_timer_records(&RecordFilter::for_key("PROJ-1"))
            .await
            .expect("list");
        assert!(proj1.is_empty());
        assert!(billing.calls().is_empty());
    }

    #[tokio::test]
    async fn start_with_billing_starts_remote_coding_timer() {
        let persistence = MemoryStore::new();
        let billing = FakeBilling::default();
        let mut timer = TaskTimer::new("PLAT");
        timer.billing = Some(billing_project(7, "PLAT", &["Meetings", "Coding"], None));
        let mut store = TimerStore::from_timers(vec![timer]);

        store
            .start("PLAT", &persistence, Some(&billing), utc(2024, 5, 6, 12, 0))
            .await
            .expect("start");

        assert_eq!(billing.calls(), vec!["start_timer(7,101)".to_string()]);
        let project = store
            .get("PLAT")
            .and_then(|timer| timer.billing.clone())
            .expect("billing ref");
        assert!(project.running_entry.is_some());
    }

    #[tokio::test]
    async fn remote_start_failure_rolls_back_local_run() {
        let persistence = MemoryStore::new();
        let billing = FakeBilling::default();
        billing.fail_with("gateway timeout");
        let mut timer = TaskTimer::new("PLAT");
        timer.billing = Some(billing_project(7, "PLAT", &["Coding"], None));
        let mut store = TimerStore::from_timers(vec![timer]);

        let err = store
            .start("PLAT", &persistence, Some(&billing), utc(2024, 5, 6, 12, 0))
            .await
            .expect_err("remote failure");

        assert!(err.is_upstream());
        assert!(!store.get("PLAT").expect("timer").is_running());
        assert!(persistence
            .list_timer_records(&RecordFilter::all())
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn start_adopts_an_already_open_persisted_run() {
        let persistence = MemoryStore::new();
        let open = StoredTimerRecord::open("A", utc(2024, 5, 6, 8, 0));
        persistence.save_timer_record(&open).await.expect("seed");
        let mut store = store_with(&["A"]);

        store
            .start("A", &persistence, None, utc(2024, 5, 6, 9, 0))
            .await
            .expect("start");

        let records = persistence
            .list_timer_records(&RecordFilter::for_key("A"))
            .await
            .expect("list");
        assert_eq!(records, vec![open.clone()]);
        assert_eq!(store.get("A").and_then(|timer| timer.run.clone()), Some(open));
    }

    #[tokio::test]
    async fn stop_on_idle_timer_is_a_no_op() {
        let persistence = FailingStore::new();
        let billing = FakeBilling::default();
        let mut timer = TaskTimer::new("A");
        timer.billing = Some(billing_project(1, "A", &["Coding"], Some(5)));
        let mut store = TimerStore::from_timers(vec![timer]);

        store
            .stop("A", &persistence, Some(&billing), utc(2024, 5, 6, 9, 0))
            .await
            .expect("idle stop succeeds");

        assert_eq!(persistence.writes(), 0);
        assert!(billing.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_persists_before_remote_and_surfaces_remote_failure() {
        let persistence = MemoryStore::new();
        let billing = FakeBilling::default();
        let mut timer = TaskTimer::new("PLAT");
        timer.billing = Some(billing_project(7, "PLAT", &["Coding"], Some(77)));
        timer.run = Some(StoredTimerRecord::open("PLAT", utc(2024, 5, 6, 9, 0)));
        persistence
            .save_timer_record(timer.run.as_ref().expect("run"))
            .await
            .expect("seed");
        let mut store = TimerStore::from_timers(vec![timer]);

        billing.fail_with("connection reset");
        let err = store
            .stop("PLAT", &persistence, Some(&billing), utc(2024, 5, 6, 11, 0))
            .await
            .expect_err("remote stop fails");

        assert!(err.is_upstream());
        assert!(!store.get("PLAT").expect("timer").is_running());
        let records = persistence
            .list_timer_records(&RecordFilter::for_key("PLAT"))
            .await
            .expect("list");
        assert_eq!(records[0].stopped_at, Some(utc(2024, 5, 6, 11, 0)));
    }

    #[tokio::test]
    async fn stop_clears_remote_entry_on_success() {
        let persistence = MemoryStore::new();
        let billing = FakeBilling::default();
        let mut timer = TaskTimer::new("PLAT");
        timer.billing = Some(billing_project(7, "PLAT", &["Coding"], Some(77)));
        timer.run = Some(StoredTimerRecord::open("PLAT", utc(2024, 5, 6, 9, 0)));
        let mut store = TimerStore::from_timers(vec![timer]);

        store
            .stop("PLAT", &persistence, Some(&billing), utc(2024, 5, 6, 10, 0))
            .await
            .expect("stop");

        assert_eq!(billing.calls(), vec!["stop_timer(77)".to_string()]);
        let project = store
            .get("PLAT")
            .and_then(|timer| timer.billing.clone())
            .expect("billing ref");
        assert_eq!(project.running_entry, None);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_timer_running() {
        let persistence = FailingStore::new();
        let mut timer = TaskTimer::new("A");
        timer.run = Some(StoredTimerRecord::open("A", utc(2024, 5, 6, 9, 0)));
        let mut store = TimerStore::from_timers(vec![timer]);
        persistence.set_failing(true);

        let err = store
            .stop("A", &persistence, None, utc(2024, 5, 6, 10, 0))
            .await
            .expect_err("store down");

        assert!(matches!(err, HarvesterError::Persistence(_)));
        assert!(store.get("A").expect("timer").is_running());
    }

    #[tokio::test]
    async fn unknown_keys_are_reported() {
        let persistence = MemoryStore::new();
        let mut store = TimerStore::new();
        let err = store
            .start("NOPE", &persistence, None, utc(2024, 5, 6, 9, 0))
            .await
            .expect_err("unknown");
        assert!(matches!(err, HarvesterError::UnknownTimer { .. }));
    }

    #[tokio::test]
    async fn at_most_one_timer_runs_across_a_sequence_of_starts() {
        let persistence = MemoryStore::new();
        let mut store = store_with(&["A", "B", "C"]);
        let sequence = ["A", "B", "B", "C", "A", "C"];
        for (minute, key) in sequence.iter().enumerate() {
            store
                .start(key, &persistence, None, utc(2024, 5, 6, 9, minute as u32))
                .await
                .expect("start");
            assert_eq!(running_count(&store), 1);
            assert_eq!(store.running().map(|timer| timer.key.as_str()), Some(*key));
        }

        let failures = store
            .stop_all(&persistence, None, utc(2024, 5, 6, 10, 0))
            .await;
        assert!(failures.is_empty());
        assert_eq!(running_count(&store), 0);
        let open = persistence
            .list_timer_records(&RecordFilter::all())
            .await
            .expect("list")
            .into_iter()
            .filter(StoredTimerRecord::is_open)
            .count();
        assert_eq!(open, 0);
    }
}
