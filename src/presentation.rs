//! Presentation boundary plus the console front end used by the binary.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::clients::redact_log_details;
use crate::config::{parse_interval, Settings};
use crate::error::{HarvesterError, Result};
use crate::scheduler::{SchedulerHandle, Snapshot, SnapshotReason};
use crate::timer::{format_elapsed, local_day};
use crate::timesheet::SheetView;

const HELP: &str = "commands: refresh | start KEY | stop KEY | stopall \
    | sheet day|week|month [OFFSET] | backfill | interval 5m | set FIELD VALUE | quit";

/// Anything that can render the scheduler's output.
pub trait Presenter: Send + Sync {
    fn show_snapshot(&self, snapshot: &Snapshot);
    fn show_error(&self, error: &HarvesterError);
}

/// Prints the timer table to stdout and reports errors through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn show_snapshot(&self, snapshot: &Snapshot) {
        match snapshot.reason {
            SnapshotReason::Tick => {
                if let Some(timer) = snapshot.running() {
                    let elapsed = timer
                        .running_duration(snapshot.taken_at)
                        .map(|duration| duration.num_seconds().max(0) as u64)
                        .unwrap_or(0);
                    info!("{} running for {}", timer.key, format_elapsed(elapsed));
                }
            }
            _ => println!("{}", render_snapshot(snapshot, snapshot.taken_at)),
        }
    }

    fn show_error(&self, error: &HarvesterError) {
        warn!("{}", redact_log_details(&error.to_string()));
    }
}

/// One line per timer: a `*` marks the running one, followed by elapsed time and summary.
pub fn render_snapshot(snapshot: &Snapshot, now: DateTime<Utc>) -> String {
    let mut lines = Vec::with_capacity(snapshot.timers.len() + 2);
    if snapshot.timers.is_empty() {
        lines.push("no timers".to_string());
    }
    for timer in &snapshot.timers {
        let (marker, elapsed) = match timer.running_duration(now) {
            Some(duration) => ("*", format_elapsed(duration.num_seconds().max(0) as u64)),
            None => (" ", "-".to_string()),
        };
        let line = format!(
            "{} {:<14} {:>8}  {}",
            marker,
            timer.key,
            elapsed,
            timer.summary().unwrap_or("")
        );
        lines.push(line.trim_end().to_string());
    }
    if let Some(error) = &snapshot.last_error {
        lines.push(format!("! last refresh failed: {}", redact_log_details(error)));
    }
    lines.join("\n")
}

/// Settings the console can edit with `set FIELD VALUE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    JiraUrl,
    JiraUser,
    JiraPass,
    HarvestAccountId,
    HarvestToken,
    BackfillInterval,
}

impl SettingField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "jira.url" => Some(SettingField::JiraUrl),
            "jira.user" => Some(SettingField::JiraUser),
            "jira.pass" => Some(SettingField::JiraPass),
            "harvest.account_id" => Some(SettingField::HarvestAccountId),
            "harvest.token" => Some(SettingField::HarvestToken),
            "backfill" => Some(SettingField::BackfillInterval),
            _ => None,
        }
    }

    /// Writes `value` into `settings`.
    pub fn apply(self, settings: &mut Settings, value: &str) -> std::result::Result<(), String> {
        match self {
            SettingField::JiraUrl => settings.jira.url = value.to_string(),
            SettingField::JiraUser => settings.jira.user = value.to_string(),
            SettingField::JiraPass => settings.jira.pass = value.to_string(),
            SettingField::HarvestAccountId => settings.harvest.account_id = value.to_string(),
            SettingField::HarvestToken => settings.harvest.token = value.to_string(),
            SettingField::BackfillInterval => {
                let period =
                    parse_interval(value).ok_or_else(|| format!("invalid interval {value:?}"))?;
                settings.backfill_interval_secs = period.as_secs();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Refresh,
    Start(String),
    Stop(String),
    StopAll,
    /// View plus how many periods away from the current one.
    Sheet(SheetView, i32),
    Backfill,
    Interval(Duration),
    Set(SettingField, String),
    Help,
    Quit,
}

/// Parses one console line; blank lines yield `Ok(None)`.
pub fn parse_input(line: &str) -> std::result::Result<Option<ConsoleInput>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let input = match (command.to_lowercase().as_str(), rest.as_slice()) {
        ("refresh", []) => ConsoleInput::Refresh,
        ("start", [key]) => ConsoleInput::Start(key.to_string()),
        ("stop", [key]) => ConsoleInput::Stop(key.to_string()),
        ("stopall", []) => ConsoleInput::StopAll,
        ("sheet", [view]) | ("sheet", [view, _]) => {
            let view = SheetView::parse(view).ok_or_else(|| format!("unknown view {view:?}"))?;
            let offset = match rest.get(1) {
                Some(value) => value
                    .parse::<i32>()
                    .map_err(|_| format!("invalid offset {value:?}"))?,
                None => 0,
            };
            ConsoleInput::Sheet(view, offset)
        }
        ("backfill", []) => ConsoleInput::Backfill,
        ("interval", [value]) => ConsoleInput::Interval(
            parse_interval(value).ok_or_else(|| format!("invalid interval {value:?}"))?,
        ),
        ("set", [field, value]) => {
            let field =
                SettingField::parse(field).ok_or_else(|| format!("unknown setting {field:?}"))?;
            ConsoleInput::Set(field, value.to_string())
        }
        ("help", _) => ConsoleInput::Help,
        ("quit", []) | ("exit", []) => ConsoleInput::Quit,
        _ => return Err(format!("unrecognised command {:?}; {}", line.trim(), HELP)),
    };
    Ok(Some(input))
}

/// Executes one console command. Returns `false` once the operator asked to quit.
pub async fn dispatch(input: ConsoleInput, handle: &SchedulerHandle) -> Result<bool> {
    match input {
        ConsoleInput::Refresh => {
            handle.refresh().await?;
        }
        ConsoleInput::Start(key) => handle.start(key).await?,
        ConsoleInput::Stop(key) => handle.stop(key).await?,
        ConsoleInput::StopAll => handle.stop_all().await?,
        ConsoleInput::Sheet(view, offset) => {
            let (start, end) = view.shifted(local_day(Utc::now()), offset);
            let sheet = handle.time_sheet(start, end).await?;
            println!("{} to {}\n{}", start, end, sheet.to_tsv(view));
            println!("total\t{:.2}", sheet.grand_total);
        }
        ConsoleInput::Backfill => match handle.backfill().await? {
            Some(report) => info!(
                "Backfill applied {} corrections, skipped {}",
                report.corrections.len(),
                report.skipped
            ),
            None => info!("Backfill needs Harvest credentials"),
        },
        ConsoleInput::Interval(period) => {
            let mut settings = handle.settings().await?;
            settings.refresh_interval_secs = period.as_secs();
            handle.apply_settings(settings).await?;
        }
        ConsoleInput::Set(field, value) => {
            let mut settings = handle.settings().await?;
            if let Err(message) = field.apply(&mut settings, &value) {
                println!("{}", message);
                return Ok(true);
            }
            handle.apply_settings(settings).await?;
        }
        ConsoleInput::Help => println!("{}", HELP),
        ConsoleInput::Quit => return Ok(false),
    }
    Ok(true)
}

/// Reads commands line by line until `quit` or end of input.
/// Why the console loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    Quit,
    EndOfInput,
}

pub async fn run_console<R>(
    handle: SchedulerHandle,
    presenter: Arc<dyn Presenter>,
    input: R,
) -> ConsoleExit
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return ConsoleExit::EndOfInput,
            Err(err) => {
                warn!("Failed to read console input: {}", err);
                return ConsoleExit::EndOfInput;
            }
        };
        match parse_input(&line) {
            Ok(None) => {}
            Ok(Some(input)) => match dispatch(input, &handle).await {
                Ok(true) => {}
                Ok(false) => return ConsoleExit::Quit,
                Err(err) => presenter.show_error(&err),
            },
            Err(message) => println!("{}", message),
        }
    }
}
