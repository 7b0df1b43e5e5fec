//! Calendar windows with absolute start and end stamps

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::{Scheduler, ScheduleError};

/// Stamp layout for calendar schedule periods
pub const SCHEDULE_PERIOD_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

fn parse_stamp(stamp: &str, timezone: Tz) -> Result<DateTime<Tz>, ScheduleError> {
    let naive = NaiveDateTime::parse_from_str(stamp, SCHEDULE_PERIOD_DATE_FORMAT)
        .map_err(|err| ScheduleError::InvalidPeriodFormat(format!("`{stamp}`: {err}")))?;
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(when) => Ok(when),
        // DST fold: take the earlier instant
        LocalResult::Ambiguous(earlier, _) => Ok(earlier),
        // DST gap: the stamp names a local time that never occurs
        LocalResult::None => Err(ScheduleError::InvalidPeriodFormat(format!(
            "`{stamp}` does not exist in timezone {timezone}"
        ))),
    }
}

/// Absolute window: `contains(t)` is `start <= t <= end`
#[derive(Debug)]
pub struct DateScheduler {
    timezone: Tz,
    raw_start: String,
    raw_end: String,
    start_time: DateTime<Tz>,
    end_time: DateTime<Tz>,
}

impl DateScheduler {
    pub fn new(timezone: Tz, start: &str, end: &str) -> Result<Self, ScheduleError> {
        let start_time = parse_stamp(start, timezone)?;
        let end_time = parse_stamp(end, timezone)?;
        if start_time >= end_time {
            return Err(ScheduleError::StartNotBeforeEnd(format!(
                "start({start}) must be before end({end})"
            )));
        }
        Ok(Self {
            timezone,
            raw_start: start.to_string(),
            raw_end: end.to_string(),
            start_time,
            end_time,
        })
    }

    /// The instant the window closes, used for retention-based purging
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time.with_timezone(&Utc)
    }
}

impl Scheduler for DateScheduler {
    fn contains(&self, when: DateTime<Utc>) -> bool {
        self.start_time <= when && when <= self.end_time
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    fn utc(stamp: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(stamp, SCHEDULE_PERIOD_DATE_FORMAT)
            .expect("test stamp")
            .and_utc()
    }

    #[test]
    fn window_includes_both_endpoints() {
        let scheduler =
            DateScheduler::new(UTC, "2024-01-01 00:00", "2024-01-02 00:00").unwrap();

        assert!(!scheduler.contains(utc("2023-12-31 23:59")));
        assert!(scheduler.contains(utc("2024-01-01 00:00")));
        assert!(scheduler.contains(utc("2024-01-01 12:30")));
        assert!(scheduler.contains(utc("2024-01-02 00:00")));
        assert!(!scheduler.contains(utc("2024-01-02 00:01")));
    }

    #[test]
    fn stamps_are_interpreted_in_the_schedule_timezone() {
        // 2024-06-01 08:00 in Shanghai is 2024-06-01 00:00 UTC
        let scheduler = DateScheduler::new(
            chrono_tz::Asia::Shanghai,
            "2024-06-01 08:00",
            "2024-06-01 20:00",
        )
        .unwrap();

        assert!(scheduler.contains(utc("2024-06-01 00:00")));
        assert!(scheduler.contains(utc("2024-06-01 11:59")));
        assert!(!scheduler.contains(utc("2024-06-01 12:01")));
    }

    #[test]
    fn start_must_precede_end() {
        let err = DateScheduler::new(UTC, "2024-01-02 00:00", "2024-01-01 00:00").unwrap_err();
        assert!(matches!(err, ScheduleError::StartNotBeforeEnd(_)));

        let err = DateScheduler::new(UTC, "2024-01-01 00:00", "2024-01-01 00:00").unwrap_err();
        assert!(matches!(err, ScheduleError::StartNotBeforeEnd(_)));
    }

    #[test]
    fn malformed_stamps_are_rejected() {
        let err = DateScheduler::new(UTC, "01/02/2024 00:00", "2024-01-02 00:00").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPeriodFormat(_)));

        let err = DateScheduler::new(UTC, "2024-01-01 00:00", "tomorrow").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPeriodFormat(_)));
    }

    #[test]
    fn end_time_is_exposed_for_purging() {
        let scheduler =
            DateScheduler::new(UTC, "2024-01-01 00:00", "2024-01-02 06:30").unwrap();
        assert_eq!(scheduler.end_time(), utc("2024-01-02 06:30"));
    }
}
