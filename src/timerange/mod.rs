//! Time-range schedulers
//!
//! A scheduler answers one question: does instant `t` lie inside the
//! window described by a `(timezone, start, end)` triple? Two variants
//! exist: calendar windows with absolute stamps and recurring windows
//! bounded by a pair of cron expressions.

mod cron;
mod date;

pub use cron::CronScheduler;
pub use date::{DateScheduler, SCHEDULE_PERIOD_DATE_FORMAT};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Separator between cron fields, also used to sniff the period format
pub const CRON_FIELD_SEPARATOR: char = ' ';

/// Errors raised while parsing schedule periods
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The minute or hour field of a cron window uses `* / - ,`
    #[error("cron schedule supports exact minute and hour value only: `{0}`")]
    ExactMinuteHourOnly(String),

    /// Not a 5-field cron spec (https://en.wikipedia.org/wiki/Cron)
    #[error("not a standard cron spec: `{0}`")]
    NotStandardSpec(String),

    /// The expression failed to parse after normalization
    #[error("invalid cron spec `{spec}`: {reason}")]
    InvalidCron { spec: String, reason: String },

    /// Start/end is neither a 5-field cron nor a `YYYY-MM-DD HH:MM` stamp
    #[error("invalid schedule period format: {0}")]
    InvalidPeriodFormat(String),

    /// Start and end specs are byte-identical, which matches nothing
    #[error("start and end spec can not be equal")]
    StartEndEqual,

    /// Calendar windows require `start < end`
    #[error("start date must be before end date: {0}")]
    StartNotBeforeEnd(String),

    /// `timezone` is empty
    #[error("timezone not found")]
    TimezoneMissing,

    /// `timezone` is not an IANA zone name
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),

    /// `start` or `end` is empty
    #[error("schedule period not found, `start` or `end` field not exists")]
    PeriodMissing,
}

/// Predicate over instants plus diagnostics accessors
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    /// True when `when` falls inside the window
    fn contains(&self, when: DateTime<Utc>) -> bool;

    /// The timezone the window is evaluated in
    fn timezone(&self) -> Tz;

    /// Raw start spec as configured
    fn start(&self) -> &str;

    /// Raw end spec as configured
    fn end(&self) -> &str;
}

/// Resolve an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    if name.is_empty() {
        return Err(ScheduleError::TimezoneMissing);
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}
