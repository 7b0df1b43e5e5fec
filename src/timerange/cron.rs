//! Recurring windows bounded by a pair of restricted cron expressions

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use super::{Scheduler, ScheduleError, CRON_FIELD_SEPARATOR};

const CRON_ANY_RANGE_LIST_CHARACTERS: &[char] = &['*', '/', '-', ','];

/// Standard cron weekday numbering, `0` and `7` both meaning Sunday
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn validate_cron_spec(spec: &str) -> Result<(), ScheduleError> {
    if spec.starts_with('@') {
        return Ok(());
    }
    let fields: Vec<&str> = spec.split(CRON_FIELD_SEPARATOR).collect();
    if fields.len() != 5 {
        return Err(ScheduleError::NotStandardSpec(spec.to_string()));
    }
    if fields[0].contains(CRON_ANY_RANGE_LIST_CHARACTERS)
        || fields[1].contains(CRON_ANY_RANGE_LIST_CHARACTERS)
    {
        return Err(ScheduleError::ExactMinuteHourOnly(spec.to_string()));
    }
    Ok(())
}

/// Rewrite one day-of-week token: numeric values become weekday names so
/// the underlying parser's Sunday-first numbering cannot shift the window.
fn translate_weekday_token(token: &str) -> String {
    match token.parse::<usize>() {
        Ok(n) => WEEKDAY_NAMES[n % 7].to_string(),
        Err(_) => token.to_string(),
    }
}

fn translate_weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let translated = match range.split_once('-') {
                Some((lo, hi)) => format!(
                    "{}-{}",
                    translate_weekday_token(lo),
                    translate_weekday_token(hi)
                ),
                None => translate_weekday_token(range),
            };
            match step {
                Some(step) => format!("{translated}/{step}"),
                None => translated,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalize a validated 5-field spec to the 6-field form the `cron`
/// crate expects (seconds prepended, weekday numbers named). Macros pass
/// through untouched.
fn normalize_cron_spec(spec: &str) -> String {
    if spec.starts_with('@') {
        return spec.to_string();
    }
    let fields: Vec<&str> = spec.split(CRON_FIELD_SEPARATOR).collect();
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        translate_weekday_field(fields[4])
    )
}

fn parse_cron_schedule_spec(spec: &str) -> Result<Schedule, ScheduleError> {
    validate_cron_spec(spec)?;
    Schedule::from_str(&normalize_cron_spec(spec)).map_err(|err| ScheduleError::InvalidCron {
        spec: spec.to_string(),
        reason: err.to_string(),
    })
}

/// Window bounded by a start and an end cron expression.
///
/// The window is active at `t` iff the next end occurrence comes before
/// the next start occurrence, which covers windows that wrap midnight or
/// week boundaries. The start minute is inside the window, the end minute
/// is not.
#[derive(Debug)]
pub struct CronScheduler {
    timezone: Tz,
    raw_start: String,
    raw_end: String,
    start_sched: Schedule,
    end_sched: Schedule,
}

impl CronScheduler {
    pub fn new(timezone: Tz, start: &str, end: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            timezone,
            raw_start: start.to_string(),
            raw_end: end.to_string(),
            start_sched: parse_cron_schedule_spec(start)?,
            end_sched: parse_cron_schedule_spec(end)?,
        })
    }
}

impl Scheduler for CronScheduler {
    fn contains(&self, when: DateTime<Utc>) -> bool {
        let local = when.with_timezone(&self.timezone);
        let next_start = self.start_sched.after(&local).next();
        let next_end = self.end_sched.after(&local).next();
        match (next_start, next_end) {
            // The window opened at or before `when` and has not ended yet
            // exactly when the next start lies beyond the next end.
            (Some(start), Some(end)) => start > end,
            _ => false,
        }
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn start(&self) -> &str {
        &self.raw_start
    }

    fn end(&self) -> &str {
        &self.raw_end
    }
}
