//! Day, week and month rollups of tracked time, plus a tab-separated export.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Utc,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::backfill::round_hours;
use crate::error::Result;
use crate::store::{Persistence, RecordFilter};
use crate::timer::local_day;

const WEEKDAY_HEADER: &str = "Mon\tTue\tWed\tThu\tFri\tSat\tSun";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SheetView {
    Day,
    Week,
    Month,
}

impl SheetView {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "day" | "today" => Some(SheetView::Day),
            "week" => Some(SheetView::Week),
            "month" => Some(SheetView::Month),
            _ => None,
        }
    }

    /// Half-open date range `[start, end)` of the period containing `day`.
    /// Weeks start on Monday.
    pub fn range_containing(self, day: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            SheetView::Day => (day, day + ChronoDuration::days(1)),
            SheetView::Week => {
                let start = monday_of(day);
                (start, start + ChronoDuration::days(7))
            }
            SheetView::Month => {
                let start = day.with_day(1).unwrap_or(day);
                (start, add_months(start, 1))
            }
        }
    }

    /// Range of the period `steps` periods away from the one containing `day`;
    /// negative steps go back.
    pub fn shifted(self, day: NaiveDate, steps: i32) -> (NaiveDate, NaiveDate) {
        let (start, _) = self.range_containing(day);
        let moved = match self {
            SheetView::Day => start + ChronoDuration::days(i64::from(steps)),
            SheetView::Week => start + ChronoDuration::weeks(i64::from(steps)),
            SheetView::Month => add_months(start, steps),
        };
        self.range_containing(moved)
    }
}

fn monday_of(day: NaiveDate) -> NaiveDate {
    day - ChronoDuration::days(i64::from(day.weekday().num_days_from_monday()))
}

fn add_months(first_of_month: NaiveDate, months: i32) -> NaiveDate {
    let index = first_of_month.year() * 12 + first_of_month.month0() as i32 + months;
    let year = index.div_euclid(12);
    let month = index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(first_of_month)
}

/// Start of a local calendar day as a UTC instant.
fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Hours per key and day over a date range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSheet {
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
    pub days: Vec<NaiveDate>,
    /// Hours per key, aligned with `days`.
    pub rows: BTreeMap<String, Vec<f64>>,
    pub daily_totals: Vec<f64>,
    pub grand_total: f64,
}

/// Builds the sheet for `[start, end)` in local days. Runs count toward the
/// day they started on and open runs are measured up to `now`.
pub async fn time_sheet(
    persistence: &dyn Persistence,
    start: NaiveDate,
    end: NaiveDate,
    now: DateTime<Utc>,
) -> Result<TimeSheet> {
    let days: Vec<NaiveDate> = start.iter_days().take_while(|day| *day < end).collect();
    let records = persistence
        .list_timer_records(
            &RecordFilter::all()
                .started_after(local_midnight(start))
                .started_before(local_midnight(end)),
        )
        .await?;

    let mut seconds: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for record in records {
        let day = local_day(record.started_at);
        let Ok(index) = usize::try_from((day - start).num_days()) else {
            continue;
        };
        if index >= days.len() {
            continue;
        }
        let row = seconds
            .entry(record.key.clone())
            .or_insert_with(|| vec![0; days.len()]);
        row[index] += record.duration(now).num_seconds();
    }

    let to_hours = |secs: i64| secs as f64 / 3600.0;
    let mut daily_seconds = vec![0i64; days.len()];
    for row in seconds.values() {
        for (total, value) in daily_seconds.iter_mut().zip(row) {
            *total += value;
        }
    }
    let grand_seconds: i64 = daily_seconds.iter().sum();
    let rows = seconds
        .into_iter()
        .map(|(key, row)| (key, row.into_iter().map(|secs| round_hours(to_hours(secs))).collect()))
        .collect();

    Ok(TimeSheet {
        start,
        end,
        days,
        rows,
        daily_totals: daily_seconds
            .into_iter()
            .map(|secs| round_hours(to_hours(secs)))
            .collect(),
        grand_total: round_hours(to_hours(grand_seconds)),
    })
}

impl TimeSheet {
    /// Tab-separated text for pasting into a spreadsheet or timesheet form.
    ///
    /// Day sheets list `KEY<TAB>hours`; week sheets add a Monday-first header;
    /// month sheets emit one row per key and week of the month.
    pub fn to_tsv(&self, view: SheetView) -> String {
        let mut out = String::new();
        match view {
            SheetView::Day => {
                for (key, hours) in &self.rows {
                    let total: f64 = hours.iter().sum();
                    let _ = writeln!(out, "{}\t{:.2}", key, total);
                }
            }
            SheetView::Week => {
                let _ = writeln!(out, "Key\t{}", WEEKDAY_HEADER);
                for (key, hours) in &self.rows {
                    out.push_str(key);
                    for weekday in 0..7 {
                        let _ = write!(out, "\t{:.2}", self.weekday_hours(hours, 0, weekday));
                    }
                    out.push('\n');
                }
            }
            SheetView::Month => {
                let _ = writeln!(out, "Week\tKey\t{}", WEEKDAY_HEADER);
                let first_monday = monday_of(self.start);
                let weeks = self
                    .days
                    .last()
                    .map(|last| (*last - first_monday).num_days() / 7 + 1)
                    .unwrap_or(0);
                for week in 0..weeks {
                    for (key, hours) in &self.rows {
                        let values: Vec<f64> = (0..7)
                            .map(|weekday| self.weekday_hours(hours, week, weekday))
                            .collect();
                        if values.iter().all(|value| *value == 0.0) {
                            continue;
                        }
                        let _ = write!(out, "{}\t{}", week + 1, key);
                        for value in values {
                            let _ = write!(out, "\t{:.2}", value);
                        }
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    /// Hours on the given weekday of the given week, counting weeks from the
    /// Monday on or before `start`. Days outside the sheet read as zero.
    fn weekday_hours(&self, hours: &[f64], week: i64, weekday: i64) -> f64 {
        let day = monday_of(self.start) + ChronoDuration::days(week * 7 + weekday);
        usize::try_from((day - self.start).num_days())
            .ok()
            .and_then(|index| hours.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}
