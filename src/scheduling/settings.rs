//! Scheduled settings overlay
//!
//! A target carries a default settings payload plus an ordered list of
//! schedule windows, each with a settings fragment. At reconcile time the
//! first window containing the current instant overlays its fragment onto
//! the default via JSON merge-patch; without a match the default applies
//! unchanged.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::crd::TargetSettings;
use crate::timerange::{
    parse_timezone, CronScheduler, DateScheduler, Scheduler, ScheduleError, CRON_FIELD_SEPARATOR,
};

/// Build the scheduler for a `(timezone, start, end)` period.
///
/// The period format is sniffed from the field count of `start`: five
/// fields make a cron window, two make a calendar window.
pub fn build_scheduler(
    timezone: &str,
    start: &str,
    end: &str,
) -> Result<Box<dyn Scheduler>, ScheduleError> {
    let tz = parse_timezone(timezone)?;
    if start.is_empty() || end.is_empty() {
        return Err(ScheduleError::PeriodMissing);
    }
    if start == end {
        return Err(ScheduleError::StartEndEqual);
    }
    match start.split(CRON_FIELD_SEPARATOR).count() {
        5 => Ok(Box::new(CronScheduler::new(tz, start, end)?)),
        2 => Ok(Box::new(DateScheduler::new(tz, start, end)?)),
        _ => Err(ScheduleError::InvalidPeriodFormat(format!(
            "`{start}` is neither a 5-field cron spec nor a date stamp"
        ))),
    }
}

/// Settings payload effective at `when`.
///
/// Malformed schedules are logged and treated as non-matching so a broken
/// window degrades to the default settings instead of blocking the
/// reconcile.
pub fn scheduled_settings(when: DateTime<Utc>, settings: &TargetSettings) -> serde_json::Value {
    let mut payload = settings.default.clone();
    for schedule in &settings.schedules {
        let scheduler = match build_scheduler(&schedule.timezone, &schedule.start, &schedule.end) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                warn!(
                    start = %schedule.start,
                    end = %schedule.end,
                    timezone = %schedule.timezone,
                    error = %err,
                    "malformed schedule treated as non-matching"
                );
                continue;
            }
        };
        if scheduler.contains(when) {
            json_patch::merge(&mut payload, &schedule.settings);
            break;
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ScheduleTargetSettings;
    use chrono::NaiveDateTime;
    use serde_json::json;

    fn utc(stamp: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M")
            .expect("test stamp")
            .and_utc()
    }

    fn schedule(
        timezone: &str,
        start: &str,
        end: &str,
        settings: serde_json::Value,
    ) -> ScheduleTargetSettings {
        ScheduleTargetSettings {
            timezone: timezone.into(),
            start: start.into(),
            end: end.into(),
            settings,
        }
    }

    mod build {
        use super::*;

        #[test]
        fn five_fields_make_a_cron_window() {
            let scheduler = build_scheduler("UTC", "0 9 * * *", "0 10 * * *").unwrap();
            assert!(scheduler.contains(utc("2024-08-15 09:30")));
        }

        #[test]
        fn two_fields_make_a_calendar_window() {
            let scheduler =
                build_scheduler("UTC", "2024-01-01 00:00", "2024-01-02 00:00").unwrap();
            assert!(scheduler.contains(utc("2024-01-01 12:00")));
        }

        #[test]
        fn other_field_counts_fail() {
            let err = build_scheduler("UTC", "0 9 * *", "0 10 * *").unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidPeriodFormat(_)));
        }

        #[test]
        fn equal_start_and_end_fail() {
            let err = build_scheduler("UTC", "0 9 * * *", "0 9 * * *").unwrap_err();
            assert!(matches!(err, ScheduleError::StartEndEqual));
        }

        #[test]
        fn empty_pieces_fail() {
            assert!(matches!(
                build_scheduler("", "0 9 * * *", "0 10 * * *"),
                Err(ScheduleError::TimezoneMissing)
            ));
            assert!(matches!(
                build_scheduler("UTC", "", "0 10 * * *"),
                Err(ScheduleError::PeriodMissing)
            ));
            assert!(matches!(
                build_scheduler("UTC", "0 9 * * *", ""),
                Err(ScheduleError::PeriodMissing)
            ));
        }
    }

    mod overlay {
        use super::*;

        /// Story: a workload targets 60% utilization by default but only
        /// 80% during Shanghai business hours, when extra latency is
        /// acceptable. At 10:00 local the overlay applies; at 20:00 the
        /// default is back.
        #[test]
        fn business_hours_overlay_in_shanghai() {
            let settings = TargetSettings {
                default: json!({"utilization": 60}),
                schedules: vec![schedule(
                    "Asia/Shanghai",
                    "0 9 * * *",
                    "0 18 * * *",
                    json!({"utilization": 80}),
                )],
            };

            // 10:00 Asia/Shanghai == 02:00 UTC
            let merged = scheduled_settings(utc("2024-08-15 02:00"), &settings);
            assert_eq!(merged["utilization"], 80);

            // 20:00 Asia/Shanghai == 12:00 UTC
            let merged = scheduled_settings(utc("2024-08-15 12:00"), &settings);
            assert_eq!(merged["utilization"], 60);
        }

        #[test]
        fn no_schedules_returns_the_default() {
            let settings = TargetSettings {
                default: json!({"utilization": 60}),
                schedules: Vec::new(),
            };
            assert_eq!(
                scheduled_settings(utc("2024-08-15 02:00"), &settings),
                json!({"utilization": 60})
            );
        }

        #[test]
        fn first_matching_schedule_wins() {
            let settings = TargetSettings {
                default: json!({"utilization": 60}),
                schedules: vec![
                    schedule("UTC", "0 0 * * *", "0 12 * * *", json!({"utilization": 70})),
                    schedule("UTC", "0 9 * * *", "0 10 * * *", json!({"utilization": 90})),
                ],
            };
            // 09:30 matches both windows; the first one in order applies
            let merged = scheduled_settings(utc("2024-08-15 09:30"), &settings);
            assert_eq!(merged["utilization"], 70);
        }

        #[test]
        fn merge_patch_semantics_apply() {
            let settings = TargetSettings {
                default: json!({
                    "threshold": 100,
                    "server": {"address": "http://prom:9090", "insecure": false},
                    "tags": ["a", "b"],
                }),
                schedules: vec![schedule(
                    "UTC",
                    "0 0 * * *",
                    "0 23 * * *",
                    json!({
                        "threshold": 250,
                        "server": {"insecure": true},
                        "tags": ["c"],
                        "address": null,
                    }),
                )],
            };
            let merged = scheduled_settings(utc("2024-08-15 12:00"), &settings);
            // Scalars replaced, objects merged recursively
            assert_eq!(merged["threshold"], 250);
            assert_eq!(merged["server"]["address"], "http://prom:9090");
            assert_eq!(merged["server"]["insecure"], true);
            // Arrays replaced wholesale
            assert_eq!(merged["tags"], json!(["c"]));
            // Nulls remove fields (none existed here, so nothing appears)
            assert!(merged.get("address").is_none());
        }

        #[test]
        fn malformed_schedules_fall_through_to_later_matches() {
            let settings = TargetSettings {
                default: json!({"utilization": 60}),
                schedules: vec![
                    schedule("UTC", "* 9 * * *", "0 10 * * *", json!({"utilization": 10})),
                    schedule("Mars/Olympus", "0 9 * * *", "0 10 * * *", json!({"utilization": 20})),
                    schedule("UTC", "0 9 * * *", "0 10 * * *", json!({"utilization": 80})),
                ],
            };
            let merged = scheduled_settings(utc("2024-08-15 09:30"), &settings);
            assert_eq!(merged["utilization"], 80);
        }

        #[test]
        fn calendar_schedules_overlay_too() {
            let settings = TargetSettings {
                default: json!({"utilization": 60}),
                schedules: vec![schedule(
                    "UTC",
                    "2024-08-15 00:00",
                    "2024-08-16 00:00",
                    json!({"utilization": 40}),
                )],
            };
            assert_eq!(
                scheduled_settings(utc("2024-08-15 12:00"), &settings)["utilization"],
                40
            );
            assert_eq!(
                scheduled_settings(utc("2024-08-17 12:00"), &settings)["utilization"],
                60
            );
        }
    }
}
