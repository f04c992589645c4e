//! Pushes locally tracked time into the billing service when the two drift apart.
//!
//! Local runs are summed per key and calendar day over a trailing window and
//! compared with the billing entries for the same project and day. Missing
//! entries are created on the project's "Coding" task; entries off by 5% or
//! more are adjusted to the local total. The first failing remote call ends the
//! run, and corrections already applied stay applied.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{Result, Service};
use crate::sources::{bounded, BillingSource, ProjectAssignment, Sources, TimeEntry, BULK_TIMEOUT};
use crate::store::{Persistence, RecordFilter};
use crate::timer::local_day;

pub const BACKFILL_WINDOW_DAYS: i64 = 35;
/// Relative difference under which local and remote hours count as equal.
pub const MATCH_TOLERANCE: f64 = 0.05;

/// Rounds to hundredths of an hour.
pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round() / 100.0
}

/// `|local/remote - 1| < 5%`. A remote of zero never matches.
pub fn within_tolerance(local: f64, remote: f64) -> bool {
    if remote <= 0.0 {
        return false;
    }
    (local / remote - 1.0).abs() < MATCH_TOLERANCE
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Correction {
    Created {
        key: String,
        day: NaiveDate,
        hours: f64,
    },
    Adjusted {
        key: String,
        day: NaiveDate,
        entry_id: u64,
        delta: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub corrections: Vec<Correction>,
    pub skipped: usize,
}

/// One backfill pass over the trailing window ending at `now`.
pub async fn backfill(
    persistence: &dyn Persistence,
    billing: &dyn BillingSource,
    now: DateTime<Utc>,
) -> Result<BackfillReport> {
    let today = local_day(now);
    let from = today - ChronoDuration::days(BACKFILL_WINDOW_DAYS);

    let remote: Vec<TimeEntry> = bounded(
        Service::Billing,
        BULK_TIMEOUT,
        billing.list_entries_since(from),
    )
    .await?
    .into_iter()
    .filter(|entry| entry.is_manager && entry.hours > 0.0)
    .collect();
    let assignments = bounded(
        Service::Billing,
        BULK_TIMEOUT,
        billing.list_my_project_assignments(),
    )
    .await?;
    let projects: HashMap<&str, &ProjectAssignment> = assignments
        .iter()
        .map(|project| (project.project_code.as_str(), project))
        .collect();

    // One extra day covers timezones ahead of UTC.
    let records = persistence
        .list_timer_records(
            &RecordFilter::all()
                .started_after(now - ChronoDuration::days(BACKFILL_WINDOW_DAYS + 1)),
        )
        .await?;
    let mut local: BTreeMap<(String, NaiveDate), f64> = BTreeMap::new();
    let mut open: BTreeSet<(String, NaiveDate)> = BTreeSet::new();
    for record in records {
        let day = local_day(record.started_at);
        if day < from {
            continue;
        }
        if record.is_open() {
            open.insert((record.key, day));
            continue;
        }
        let hours = record.duration(now).num_seconds() as f64 / 3600.0;
        *local.entry((record.key, day)).or_insert(0.0) += hours;
    }

    let mut report = BackfillReport::default();
    for ((key, day), hours) in local {
        let hours = round_hours(hours);
        if hours <= 0.0 {
            report.skipped += 1;
            continue;
        }
        if open.contains(&(key.clone(), day)) {
            debug!("Backfill skipping {} on {}: run still open", key, day);
            report.skipped += 1;
            continue;
        }
        let Some(project) = projects.get(key.as_str()) else {
            debug!("Backfill skipping {}: no billing project", key);
            report.skipped += 1;
            continue;
        };

        let matching: Vec<&TimeEntry> = remote
            .iter()
            .filter(|entry| entry.project_id == project.project_id && entry.spent_date == day)
            .collect();
        if matching.iter().any(|entry| entry.is_running) {
            debug!("Backfill skipping {} on {}: billing timer running", key, day);
            report.skipped += 1;
            continue;
        }

        match matching.first() {
            None => {
                let Some(task) = project.coding_task() else {
                    debug!("Backfill skipping {}: no Coding task", key);
                    report.skipped += 1;
                    continue;
                };
                bounded(
                    Service::Billing,
                    BULK_TIMEOUT,
                    billing.create_entry(project.project_id, task.task_id, hours, day),
                )
                .await?;
                info!("Backfill created {:.2}h for {} on {}", hours, key, day);
                report.corrections.push(Correction::Created { key, day, hours });
            }
            Some(first) => {
                let remote_hours = round_hours(matching.iter().map(|entry| entry.hours).sum());
                if within_tolerance(hours, remote_hours) {
                    report.skipped += 1;
                    continue;
                }
                let delta = round_hours(hours - remote_hours);
                bounded(
                    Service::Billing,
                    BULK_TIMEOUT,
                    billing.update_entry_hours(first.id, round_hours(first.hours + delta)),
                )
                .await?;
                info!("Backfill adjusted {} on {} by {:+.2}h", key, day, delta);
                report.corrections.push(Correction::Adjusted {
                    key,
                    day,
                    entry_id: first.id,
                    delta,
                });
            }
        }
    }

    info!(
        "Backfill finished: {} corrections, {} skipped",
        report.corrections.len(),
        report.skipped
    );
    Ok(report)
}

pub type BackfillRequest = oneshot::Sender<Result<Option<BackfillReport>>>;

/// Periodic and on-demand backfill, independent of the refresh loop.
pub struct BackfillWorker {
    pub persistence: Arc<dyn Persistence>,
    pub sources: watch::Receiver<Sources>,
    pub period: watch::Receiver<Duration>,
    pub requests: mpsc::Receiver<BackfillRequest>,
    pub shutdown: watch::Receiver<bool>,
}

impl BackfillWorker {
    /// Runs until shutdown. Requests answer `None` when billing is not configured.
    pub async fn run(mut self) {
        let mut period = *self.period.borrow();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!("Backfill failed: {}", err);
                    }
                }
                Some(reply) = self.requests.recv() => {
                    let _ = reply.send(self.run_once().await);
                }
                changed = self.period.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *self.period.borrow();
                    if next != period {
                        period = next;
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        debug!("Backfill interval set to {}s", period.as_secs());
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Backfill worker stopping");
    }

    async fn run_once(&self) -> Result<Option<BackfillReport>> {
        let billing = self.sources.borrow().billing.clone();
        let Some(billing) = billing else {
            debug!("Backfill skipped: billing not configured");
            return Ok(None);
        };
        backfill(self.persistence.as_ref(), billing.as_ref(), Utc::now())
            .await
            .map(Some)
    }
}
