//! The scheduling loop: sole owner of the timer store and settings.
//!
//! Every mutation arrives as a [`Command`] on one queue and is applied in
//! order, so start/stop/refresh never interleave. Views leave the loop as
//! immutable [`Snapshot`]s through a watch channel and the [`Presenter`].
//! Backfill and purge run as separate tasks that see the current client
//! handles through a watch channel and stop when the loop shuts down.

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

use crate::backfill::{BackfillReport, BackfillRequest, BackfillWorker};
use crate::clients::{redact_log_details, SourceFactory};
use crate::config::{normalize_settings, Settings};
use crate::error::{HarvesterError, Result};
use crate::presentation::Presenter;
use crate::purge::{run_purger, PURGE_INTERVAL};
use crate::reconcile::Reconciler;
use crate::sources::Sources;
use crate::store::Persistence;
use crate::timer::{TaskTimer, TimerStore};
use crate::timesheet::{time_sheet, TimeSheet};

/// How often the snapshot is republished so running durations stay current.
pub const DISPLAY_TICK: Duration = Duration::from_secs(30);
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnapshotReason {
    Startup,
    Refreshed,
    Changed,
    Tick,
}

/// Read-only copy of the loop's state handed to presentation.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub reason: SnapshotReason,
    pub taken_at: DateTime<Utc>,
    pub timers: Vec<TaskTimer>,
    pub billing_url: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            reason: SnapshotReason::Startup,
            taken_at: Utc::now(),
            timers: Vec::new(),
            billing_url: None,
            refreshed_at: None,
            last_error: None,
        }
    }

    pub fn running(&self) -> Option<&TaskTimer> {
        self.timers.iter().find(|timer| timer.is_running())
    }

    pub fn get(&self, key: &str) -> Option<&TaskTimer> {
        self.timers.iter().find(|timer| timer.key == key)
    }
}

pub enum Command {
    Refresh {
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Start {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StopAll {
        reply: oneshot::Sender<Result<()>>,
    },
    ApplySettings {
        settings: Settings,
        reply: oneshot::Sender<Result<()>>,
    },
    GetSettings {
        reply: oneshot::Sender<Settings>,
    },
    TimeSheet {
        start: NaiveDate,
        end: NaiveDate,
        reply: oneshot::Sender<Result<TimeSheet>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    backfill: mpsc::Sender<BackfillRequest>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| HarvesterError::SchedulerClosed)?;
        response.await.map_err(|_| HarvesterError::SchedulerClosed)
    }

    pub async fn refresh(&self) -> Result<Snapshot> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    pub async fn start(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.request(|reply| Command::Start { key, reply }).await?
    }

    pub async fn stop(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.request(|reply| Command::Stop { key, reply }).await?
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.request(|reply| Command::StopAll { reply }).await?
    }

    pub async fn apply_settings(&self, settings: Settings) -> Result<()> {
        self.request(|reply| Command::ApplySettings { settings, reply })
            .await?
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.request(|reply| Command::GetSettings { reply }).await
    }

    /// Rollup for local days in `[start, end)`.
    pub async fn time_sheet(&self, start: NaiveDate, end: NaiveDate) -> Result<TimeSheet> {
        self.request(|reply| Command::TimeSheet { start, end, reply })
            .await?
    }

    /// Runs a backfill now. `None` when billing is not configured.
    pub async fn backfill(&self) -> Result<Option<BackfillReport>> {
        let (reply, response) = oneshot::channel();
        self.backfill
            .send(reply)
            .await
            .map_err(|_| HarvesterError::SchedulerClosed)?;
        response.await.map_err(|_| HarvesterError::SchedulerClosed)?
    }

    /// Flushes settings, stops running timers and waits for background jobs to end.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }
}

pub struct Scheduler {
    persistence: Arc<dyn Persistence>,
    factory: Arc<dyn SourceFactory>,
    presenter: Arc<dyn Presenter>,
    settings: Settings,
    sources: Sources,
    store: TimerStore,
    reconciler: Reconciler,
    refreshed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<Snapshot>,
    sources_tx: watch::Sender<Sources>,
    backfill_period_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Loads settings, builds clients and starts the loop plus the backfill and purge tasks.
    pub async fn spawn(
        persistence: Arc<dyn Persistence>,
        factory: Arc<dyn SourceFactory>,
        presenter: Arc<dyn Presenter>,
    ) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        let settings = normalize_settings(persistence.load_settings().await?.unwrap_or_default());
        let sources = initial_sources(factory.as_ref(), &settings, presenter.as_ref());
        info!(
            "Scheduler starting (refresh every {}s, backfill every {}s)",
            settings.refresh_interval().as_secs(),
            settings.backfill_interval().as_secs()
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (backfill_tx, backfill_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty());
        let (sources_tx, sources_rx) = watch::channel(sources.clone());
        let (backfill_period_tx, backfill_period_rx) = watch::channel(settings.backfill_interval());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = vec![
            tokio::spawn(run_purger(
                persistence.clone(),
                PURGE_INTERVAL,
                shutdown_rx.clone(),
            )),
            tokio::spawn(
                BackfillWorker {
                    persistence: persistence.clone(),
                    sources: sources_rx,
                    period: backfill_period_rx,
                    requests: backfill_rx,
                    shutdown: shutdown_rx,
                }
                .run(),
            ),
        ];

        let scheduler = Scheduler {
            persistence,
            factory,
            presenter,
            settings,
            sources,
            store: TimerStore::new(),
            reconciler: Reconciler::new(),
            refreshed_at: None,
            last_error: None,
            commands: command_rx,
            snapshot_tx,
            sources_tx,
            backfill_period_tx,
            shutdown_tx,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            backfill: backfill_tx,
            snapshots: snapshot_rx,
        };
        Ok((handle, tokio::spawn(scheduler.run(workers))))
    }

    async fn run(mut self, workers: Vec<JoinHandle<()>>) {
        let mut refresh = refresh_ticker(self.settings.refresh_interval(), true);
        let mut display = interval_at(Instant::now() + DISPLAY_TICK, DISPLAY_TICK);
        display.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(err) = self.refresh().await {
                        self.presenter.show_error(&err);
                    }
                }
                _ = display.tick() => {
                    self.publish(SnapshotReason::Tick);
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All scheduler handles dropped");
                        break;
                    };
                    let period = self.settings.refresh_interval();
                    if let Some(reply) = self.handle(command).await {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    if self.settings.refresh_interval() != period {
                        debug!(
                            "Refresh interval changed to {}s",
                            self.settings.refresh_interval().as_secs()
                        );
                        refresh = refresh_ticker(self.settings.refresh_interval(), false);
                    }
                }
            }
        }

        self.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("Background job ended abnormally: {}", err);
            }
        }
        info!("Scheduler stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Applies one command. Returns the reply channel when the loop should stop.
    async fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Refresh { reply } => {
                let result = self.refresh().await.map(|_| self.snapshot(SnapshotReason::Refreshed));
                let _ = reply.send(result);
            }
            Command::Start { key, reply } => {
                let result = self
                    .store
                    .start(
                        &key,
                        self.persistence.as_ref(),
                        self.sources.billing.as_deref(),
                        Utc::now(),
                    )
                    .await;
                self.log_transition("start", &key, &result);
                self.publish(SnapshotReason::Changed);
                let _ = reply.send(result);
            }
            Command::Stop { key, reply } => {
                let result = self
                    .store
                    .stop(
                        &key,
                        self.persistence.as_ref(),
                        self.sources.billing.as_deref(),
                        Utc::now(),
                    )
                    .await;
                self.log_transition("stop", &key, &result);
                self.publish(SnapshotReason::Changed);
                let _ = reply.send(result);
            }
            Command::StopAll { reply } => {
                let failures = self.stop_all().await;
                self.publish(SnapshotReason::Changed);
                let _ = reply.send(match failures.into_iter().next() {
                    Some((_, err)) => Err(err),
                    None => Ok(()),
                });
            }
            Command::GetSettings { reply } => {
                let _ = reply.send(self.settings.clone());
            }
            Command::TimeSheet { start, end, reply } => {
                let result = time_sheet(self.persistence.as_ref(), start, end, Utc::now()).await;
                let _ = reply.send(result);
            }
            Command::ApplySettings { settings, reply } => {
                let _ = reply.send(self.apply_settings(settings).await);
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    /// Replaces the store only when the reconciliation succeeds in full.
    async fn refresh(&mut self) -> Result<()> {
        let now = Utc::now();
        match self
            .reconciler
            .refresh(&self.sources, self.persistence.as_ref(), now)
            .await
        {
            Ok(store) => {
                self.store.replace(store);
                self.refreshed_at = Some(now);
                self.last_error = None;
                self.publish(SnapshotReason::Refreshed);
                Ok(())
            }
            Err(err) => {
                warn!("Refresh failed; keeping previous timers");
                debug!("Refresh failure details: {}", redact_log_details(&err.to_string()));
                self.last_error = Some(err.to_string());
                self.publish(SnapshotReason::Refreshed);
                Err(err)
            }
        }
    }

    /// Rebuilds clients whose credentials changed, persists, swaps, then refreshes.
    /// A failed refresh is returned but the new settings stay applied.
    async fn apply_settings(&mut self, next: Settings) -> Result<()> {
        let next = normalize_settings(next);
        let jira_changed = self.settings.jira_changed(&next);
        let harvest_changed = self.settings.harvest_changed(&next);

        let mut sources = self.sources.clone();
        if jira_changed {
            sources.issues = self.factory.issues(&next.jira)?;
        }
        if harvest_changed {
            sources.billing = self.factory.billing(&next.harvest)?;
        }
        self.persistence.save_settings(&next).await?;

        if jira_changed || harvest_changed {
            info!(
                "Rebuilt clients (issue tracker: {}, billing: {})",
                jira_changed, harvest_changed
            );
            self.sources = sources;
            self.sources_tx.send_replace(self.sources.clone());
        }
        if harvest_changed {
            self.reconciler.reset_billing_url();
        }
        if next.backfill_interval() != self.settings.backfill_interval() {
            self.backfill_period_tx.send_replace(next.backfill_interval());
        }
        self.settings = next;
        self.refresh().await
    }

    async fn stop_all(&mut self) -> Vec<(String, HarvesterError)> {
        let failures = self
            .store
            .stop_all(
                self.persistence.as_ref(),
                self.sources.billing.as_deref(),
                Utc::now(),
            )
            .await;
        for (key, err) in &failures {
            warn!("Failed to stop {}", key);
            debug!("Stop failure details: {}", redact_log_details(&err.to_string()));
        }
        failures
    }

    async fn shutdown(&mut self) {
        info!("Scheduler shutting down");
        if let Err(err) = self.persistence.save_settings(&self.settings).await {
            warn!("Failed to save settings on shutdown: {}", err);
        }
        self.stop_all().await;
        self.publish(SnapshotReason::Changed);
    }

    fn log_transition(&self, action: &str, key: &str, result: &Result<()>) {
        if let Err(err) = result {
            warn!("Failed to {} {}", action, key);
            debug!("{} failure details: {}", action, redact_log_details(&err.to_string()));
        }
    }

    fn snapshot(&self, reason: SnapshotReason) -> Snapshot {
        Snapshot {
            reason,
            taken_at: Utc::now(),
            timers: self.store.snapshot(),
            billing_url: self.reconciler.billing_url().map(|url| url.to_string()),
            refreshed_at: self.refreshed_at,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self, reason: SnapshotReason) {
        let snapshot = self.snapshot(reason);
        self.presenter.show_snapshot(&snapshot);
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn refresh_ticker(period: Duration, immediate: bool) -> Interval {
    let mut ticker = if immediate {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn initial_sources(
    factory: &dyn SourceFactory,
    settings: &Settings,
    presenter: &dyn Presenter,
) -> Sources {
    let issues = factory.issues(&settings.jira).unwrap_or_else(|err| {
        presenter.show_error(&err);
        None
    });
    let billing = factory.billing(&settings.harvest).unwrap_or_else(|err| {
        presenter.show_error(&err);
        None
    });
    Sources::new(issues, billing)
}
