//! Next-occurrence computation for schedule recurrence rules.
//!
//! All times are UTC and every result is strictly after `now`.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use crate::models::schedule::{Recurrence, ScheduleConfig};
use crate::{AppError, Result};

const QUARTER_MONTHS: [u32; 4] = [1, 4, 7, 10];
const ALL_MONTHS: [u32; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

/// Parse a five-field cron expression (`minute hour dom month dow`).
///
/// # Errors
///
/// Returns `AppError::Config` if the expression does not have five
/// fields or does not parse.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(AppError::Config(format!(
            "cron expression '{expression}' has {fields} fields, expected 5"
        )));
    }
    // The cron crate wants a leading seconds field.
    cron::Schedule::from_str(&format!("0 {expression}"))
        .map_err(|err| AppError::Config(format!("invalid cron expression '{expression}': {err}")))
}

/// First occurrence of `recurrence` strictly after `now`.
///
/// # Errors
///
/// Returns `AppError::Config` if the rule is invalid or never fires.
pub fn next_after(recurrence: &Recurrence, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match recurrence {
        Recurrence::Daily { hour, minute } => {
            let today = at(now.date_naive(), *hour, *minute)?;
            if today > now {
                Ok(today)
            } else {
                at(add_days(now.date_naive(), 1)?, *hour, *minute)
            }
        }
        Recurrence::Weekly {
            weekday,
            hour,
            minute,
        } => {
            let ahead = (7 + weekday.num_days_from_monday()
                - now.weekday().num_days_from_monday())
                % 7;
            let candidate = at(add_days(now.date_naive(), u64::from(ahead))?, *hour, *minute)?;
            if candidate > now {
                Ok(candidate)
            } else {
                at(add_days(candidate.date_naive(), 7)?, *hour, *minute)
            }
        }
        Recurrence::Monthly { day, hour, minute } => {
            next_on_day(now, *day, *hour, *minute, &ALL_MONTHS)
        }
        Recurrence::Quarterly { day, hour, minute } => {
            next_on_day(now, *day, *hour, *minute, &QUARTER_MONTHS)
        }
        Recurrence::Cron { expression } => parse_cron(expression)?
            .after(&now)
            .next()
            .ok_or_else(|| AppError::Config(format!("cron expression '{expression}' never fires"))),
    }
}

/// Compute `next_run_at` for every content rule, then `next_execution_at`.
///
/// # Errors
///
/// Returns `AppError::Config` if any rule is invalid.
pub fn seed_next_runs(schedule: &mut ScheduleConfig, now: DateTime<Utc>) -> Result<()> {
    for rule in &mut schedule.content_schedules {
        rule.next_run_at = Some(next_after(&rule.recurrence, now)?);
    }
    schedule.refresh_next_execution();
    Ok(())
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
    date.and_hms_opt(hour, minute, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| AppError::Config(format!("invalid time {hour}:{minute}")))
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| AppError::Config("date out of range".into()))
}

/// Months lacking `day` are skipped.
fn next_on_day(
    now: DateTime<Utc>,
    day: u32,
    hour: u32,
    minute: u32,
    months: &[u32],
) -> Result<DateTime<Utc>> {
    let (mut year, mut month) = (now.year(), now.month());
    for _ in 0..60 {
        if months.contains(&month) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                let candidate = at(date, hour, minute)?;
                if candidate > now {
                    return Ok(candidate);
                }
            }
        }
        if month == 12 {
            month = 1;
            year += 1;
        } else {
            month += 1;
        }
    }
    Err(AppError::Config(format!("day {day} never occurs in the allowed months")))
}
