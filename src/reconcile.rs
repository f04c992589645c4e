//! Refresh cycle: merges persisted runs with live issue and billing data into a new [`TimerStore`].

use chrono::{DateTime, Utc};
use harvester_api::Url;
use log::{debug, info, warn};
use std::collections::BTreeMap;

use crate::error::{HarvesterError, Result, Service};
use crate::purge::retention_threshold;
use crate::sources::{bounded, join_running, Sources, INTERACTIVE_TIMEOUT};
use crate::store::{Persistence, RecordFilter, StoredTimerRecord};
use crate::timer::{TaskTimer, TimerStore};

/// Owns the cached billing base URL between refreshes.
#[derive(Debug, Default)]
pub struct Reconciler {
    billing_url: Option<Url>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn billing_url(&self) -> Option<&Url> {
        self.billing_url.as_ref()
    }

    /// Forgets the cached URL; called when billing credentials change.
    pub fn reset_billing_url(&mut self) {
        self.billing_url = None;
    }

    /// Computes the next timer store. Nothing is returned unless every
    /// configured source answered, so a failure never yields a half-merged view.
    pub async fn refresh(
        &mut self,
        sources: &Sources,
        persistence: &dyn Persistence,
        now: DateTime<Utc>,
    ) -> Result<TimerStore> {
        let records = persistence
            .list_timer_records(&RecordFilter::all().started_after(retention_threshold(now)))
            .await?;
        let (records, healed) = heal_open_runs(records);
        let mut latest: BTreeMap<String, StoredTimerRecord> = BTreeMap::new();
        for record in records {
            latest.insert(record.key.clone(), record);
        }

        let mut working: BTreeMap<String, TaskTimer> = BTreeMap::new();
        if let Some(issues) = sources.issues.as_ref() {
            let issues = bounded(
                Service::Issues,
                INTERACTIVE_TIMEOUT,
                issues.list_active_issues(),
            )
            .await?;
            debug!("Issue tracker returned {} active issues", issues.len());
            for issue in issues {
                let key = issue.key.clone();
                slot(&mut working, &latest, &key).issue = Some(issue);
            }
        }

        if let Some(billing) = sources.billing.as_ref() {
            if self.billing_url.is_none() {
                let url = bounded(
                    Service::Billing,
                    INTERACTIVE_TIMEOUT,
                    billing.company_base_url(),
                )
                .await?;
                info!("Billing account resolved to {}", url);
                self.billing_url = Some(url);
            }
            let running = bounded(
                Service::Billing,
                INTERACTIVE_TIMEOUT,
                billing.list_running_entries(),
            )
            .await?;
            let assignments = bounded(
                Service::Billing,
                INTERACTIVE_TIMEOUT,
                billing.list_my_project_assignments(),
            )
            .await?;
            for project in join_running(assignments, &running) {
                let code = project.assignment.project_code.trim().to_string();
                if code.is_empty() {
                    debug!(
                        "Skipping billing project {} without a code",
                        project.assignment.project_id
                    );
                    continue;
                }
                slot(&mut working, &latest, &code).billing = Some(project);
            }
        }

        // A running entry stays visible so it can always be stopped.
        for record in latest.values().filter(|record| record.is_open()) {
            if !working.contains_key(&record.key) {
                debug!("Keeping running timer {} without a live source", record.key);
                slot(&mut working, &latest, &record.key);
            }
        }

        // Healed runs are only written once every source has answered.
        for record in &healed {
            persistence.save_timer_record(record).await?;
            debug!("Closed stale run {}", record.id);
        }

        let store = TimerStore::from_timers(working.into_values().collect());
        info!("Refresh produced {} timers", store.len());
        Ok(store)
    }
}

/// Finds or creates the working entry for `key`, seeded with its latest run.
fn slot<'a>(
    working: &'a mut BTreeMap<String, TaskTimer>,
    latest: &BTreeMap<String, StoredTimerRecord>,
    key: &str,
) -> &'a mut TaskTimer {
    working.entry(key.to_string()).or_insert_with(|| {
        let mut timer = TaskTimer::new(key);
        timer.run = latest.get(key).cloned();
        timer
    })
}

/// Resolves duplicate open runs: the most recent one stays open and every
/// older one is closed where the following run began. Returns the adjusted
/// records and the copies that still need saving.
fn heal_open_runs(
    mut records: Vec<StoredTimerRecord>,
) -> (Vec<StoredTimerRecord>, Vec<StoredTimerRecord>) {
    let open: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, record)| record.is_open())
        .map(|(index, _)| index)
        .collect();
    if open.len() <= 1 {
        return (records, Vec::new());
    }

    let violation = HarvesterError::InvariantViolation(format!(
        "{} open runs found, keeping the latest",
        open.len()
    ));
    warn!("{}", violation);
    let mut healed = Vec::new();
    for &index in &open[..open.len() - 1] {
        let Some(next_start) = records.get(index + 1).map(|next| next.started_at) else {
            continue;
        };
        let record = &mut records[index];
        record.stopped_at = Some(next_start.max(record.started_at));
        healed.push(record.clone());
    }
    (records, healed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::TimeEntry;
    use crate::store::MemoryStore;
    use crate::testing::{assignment, closed_record, date, utc, FakeBilling, FakeIssues};
    use chrono::Duration;
    use std::sync::Arc;

    fn keys(store: &TimerStore) -> Vec<String> {
        store.iter().map(|timer| timer.key.clone()).collect()
    }

    fn sources(
        issues: FakeIssues,
        billing: FakeBilling,
    ) -> (Sources, Arc<FakeIssues>, Arc<FakeBilling>) {
        let issues = Arc::new(issues);
        let billing = Arc::new(billing);
        let sources = Sources::new(Some(issues.clone()), Some(billing.clone()));
        (sources, issues, billing)
    }

    #[tokio::test]
    async fn merges_issue_and_billing_keys_in_key_order() {
        let (sources, _, _) = sources(
            FakeIssues::with_keys(&["B", "A"]),
            FakeBilling::with_assignments(vec![
                assignment(2, "C", &["Coding"]),
                assignment(1, "B", &["Coding"]),
            ]),
        );
        let persistence = MemoryStore::new();
        let mut reconciler = Reconciler::new();

        let store = reconciler
            .refresh(&sources, &persistence, utc(2024, 5, 6, 9, 0))
            .await
            .expect("refresh");

        assert_eq!(keys(&store), vec!["A", "B", "C"]);
        let b = store.get("B").expect("B");
        assert!(b.issue.is_some());
        assert!(b.billing.is_some());
        assert!(store.get("A").and_then(|timer| timer.billing.as_ref()).is_none());
        assert!(store.get("C").and_then(|timer| timer.issue.as_ref()).is_none());
        assert_eq!(
            reconciler.billing_url().map(Url::as_str),
            Some("https://acme.harvestapp.com/")
        );
    }

    #[tokio::test]
    async fn billing_failure_aborts_the_whole_refresh() {
        let (sources, _, billing) = sources(
            FakeIssues::with_keys(&["A"]),
            FakeBilling::with_assignments(vec![assignment(1, "B", &["Coding"])]),
        );
        billing.fail_with("connection refused");
        let mut reconciler = Reconciler::new();

        let err = reconciler
            .refresh(&sources, &MemoryStore::new(), utc(2024, 5, 6, 9, 0))
            .await
            .expect_err("billing down");

        assert!(matches!(err, HarvesterError::Upstream { service: Service::Billing, .. }));
        assert!(reconciler.billing_url().is_none());
    }

    #[tokio::test]
    async fn issue_failure_aborts_before_billing_is_contacted() {
        let (sources, issues, billing) = sources(
            FakeIssues::with_keys(&["A"]),
            FakeBilling::with_assignments(vec![assignment(1, "B", &["Coding"])]),
        );
        issues.fail_with("401 unauthorized");

        let err = Reconciler::new()
            .refresh(&sources, &MemoryStore::new(), utc(2024, 5, 6, 9, 0))
            .await
            .expect_err("issues down");

        assert!(matches!(err, HarvesterError::Upstream { service: Service::Issues, .. }));
        assert_eq!(billing.company_lookups(), 0);
    }

    #[tokio::test]
    async fn persisted_runs_attach_and_stale_keys_drop_out() {
        let persistence = MemoryStore::new();
        let now = utc(2024, 5, 6, 12, 0);
        persistence
            .save_timer_record(&closed_record("A", utc(2024, 5, 6, 8, 0), utc(2024, 5, 6, 9, 0)))
            .await
            .expect("seed A");
        persistence
            .save_timer_record(&closed_record("OLD", utc(2024, 5, 2, 8, 0), utc(2024, 5, 2, 9, 0)))
            .await
            .expect("seed OLD");
        let sources = Sources::new(Some(Arc::new(FakeIssues::with_keys(&["A"]))), None);

        let store = Reconciler::new()
            .refresh(&sources, &persistence, now)
            .await
            .expect("refresh");

        assert_eq!(keys(&store), vec!["A"]);
        let a = store.get("A").expect("A");
        assert_eq!(a.stopped_at(), Some(utc(2024, 5, 6, 9, 0)));
        assert!(!a.is_running());
    }

    #[tokio::test]
    async fn running_entry_survives_when_no_source_lists_it() {
        let persistence = MemoryStore::new();
        persistence
            .save_timer_record(&StoredTimerRecord::open("GONE", utc(2024, 5, 6, 8, 0)))
            .await
            .expect("seed");
        let sources = Sources::new(Some(Arc::new(FakeIssues::with_keys(&["A"]))), None);

        let store = Reconciler::new()
            .refresh(&sources, &persistence, utc(2024, 5, 6, 12, 0))
            .await
            .expect("refresh");

        assert_eq!(keys(&store), vec!["A", "GONE"]);
        assert_eq!(store.running().map(|timer| timer.key.as_str()), Some("GONE"));
    }

    #[tokio::test]
    async fn duplicate_open_runs_are_healed_to_the_latest() {
        let persistence = MemoryStore::new();
        persistence
            .save_timer_record(&StoredTimerRecord::open("A", utc(2024, 5, 6, 8, 0)))
            .await
            .expect("seed A");
        persistence
            .save_timer_record(&StoredTimerRecord::open("B", utc(2024, 5, 6, 10, 0)))
            .await
            .expect("seed B");
        let sources = Sources::new(Some(Arc::new(FakeIssues::with_keys(&["A", "B"]))), None);

        let store = Reconciler::new()
            .refresh(&sources, &persistence, utc(2024, 5, 6, 12, 0))
            .await
            .expect("refresh");

        assert_eq!(store.iter().filter(|timer| timer.is_running()).count(), 1);
        assert_eq!(store.running().map(|timer| timer.key.as_str()), Some("B"));
        let a = persistence
            .list_timer_records(&RecordFilter::for_key("A"))
            .await
            .expect("list");
        assert_eq!(a[0].stopped_at, Some(utc(2024, 5, 6, 10, 0)));
    }

    #[tokio::test]
    async fn failed_refresh_leaves_duplicate_open_runs_unwritten() {
        let persistence = MemoryStore::new();
        persistence
            .save_timer_record(&StoredTimerRecord::open("A", utc(2024, 5, 6, 8, 0)))
            .await
            .expect("seed A");
        persistence
            .save_timer_record(&StoredTimerRecord::open("B", utc(2024, 5, 6, 10, 0)))
            .await
            .expect("seed B");
        let (sources, _, billing) = sources(
            FakeIssues::with_keys(&["A", "B"]),
            FakeBilling::with_assignments(vec![assignment(1, "A", &["Coding"])]),
        );
        billing.fail_with("503 service unavailable");

        Reconciler::new()
            .refresh(&sources, &persistence, utc(2024, 5, 6, 12, 0))
            .await
            .expect_err("billing down");

        let open = persistence
            .list_timer_records(&RecordFilter::all())
            .await
            .expect("list")
            .into_iter()
            .filter(StoredTimerRecord::is_open)
            .count();
        assert_eq!(open, 2);
    }

    #[tokio::test]
    async fn runs_beyond_retention_are_ignored() {
        let persistence = MemoryStore::new();
        let now = utc(2024, 5, 6, 12, 0);
        persistence
            .save_timer_record(&StoredTimerRecord::open("ANCIENT", now - Duration::days(91)))
            .await
            .expect("seed");

        let store = Reconciler::new()
            .refresh(&Sources::default(), &persistence, now)
            .await
            .expect("refresh");

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn billing_url_is_cached_until_reset() {
        let (sources, _, billing) = sources(
            FakeIssues::default(),
            FakeBilling::with_assignments(vec![assignment(1, "B", &["Coding"])]),
        );
        let persistence = MemoryStore::new();
        let mut reconciler = Reconciler::new();
        let now = utc(2024, 5, 6, 9, 0);

        reconciler.refresh(&sources, &persistence, now).await.expect("first");
        reconciler.refresh(&sources, &persistence, now).await.expect("second");
        assert_eq!(billing.company_lookups(), 1);

        reconciler.reset_billing_url();
        reconciler.refresh(&sources, &persistence, now).await.expect("third");
        assert_eq!(billing.company_lookups(), 2);
    }

    #[tokio::test]
    async fn running_remote_entries_join_their_project() {
        let billing = FakeBilling::with_assignments(vec![
            assignment(7, "PLAT", &["Coding"]),
            assignment(8, "OPS", &["Coding"]),
        ]);
        billing.set_entries(vec![TimeEntry {
            id: 55,
            project_id: 7,
            project_code: "PLAT".into(),
            task_id: 100,
            is_running: true,
            hours: 1.5,
            is_manager: true,
            spent_date: date(2024, 5, 6),
        }]);
        let sources = Sources::new(None, Some(Arc::new(billing)));

        let store = Reconciler::new()
            .refresh(&sources, &MemoryStore::new(), utc(2024, 5, 6, 9, 0))
            .await
            .expect("refresh");

        let running_entry = |key: &str| {
            store
                .get(key)
                .and_then(|timer| timer.billing.as_ref())
                .and_then(|project| project.running_entry)
                .map(|entry| entry.id)
        };
        assert_eq!(running_entry("PLAT"), Some(55));
        assert_eq!(running_entry("OPS"), None);
    }
}
