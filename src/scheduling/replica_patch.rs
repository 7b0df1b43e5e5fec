//! Replica patch selection and retention-based purging
//!
//! Replica patches ride in an annotation and temporarily override the
//! autoscaler's `(min, max)` bounds while their window is active. Expired
//! calendar patches are purged from the annotation once their retention
//! lapses; cron patches recur and are never purged.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use super::settings::build_scheduler;
use crate::crd::ReplicaPatch;
use crate::timerange::{parse_timezone, DateScheduler};

/// The first patch whose window contains `when`, if any.
///
/// Malformed patches are logged and skipped, mirroring how malformed
/// settings schedules degrade.
pub fn active_replica_patch<'a>(
    when: DateTime<Utc>,
    patches: &'a [ReplicaPatch],
) -> Option<&'a ReplicaPatch> {
    for patch in patches {
        let scheduler = match build_scheduler(&patch.timezone, &patch.start, &patch.end) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                warn!(
                    start = %patch.start,
                    end = %patch.end,
                    error = %err,
                    "malformed replica patch treated as non-matching"
                );
                continue;
            }
        };
        if scheduler.contains(when) {
            return Some(patch);
        }
    }
    None
}

/// Drop calendar patches whose `end + retention` lies before `now`.
///
/// Returns the surviving patches and whether anything was removed. Cron
/// patches and patches that fail to parse are kept untouched.
pub fn purge_expired_patches(
    patches: Vec<ReplicaPatch>,
    now: DateTime<Utc>,
) -> (Vec<ReplicaPatch>, bool) {
    let original_len = patches.len();
    let kept: Vec<ReplicaPatch> = patches
        .into_iter()
        .filter(|patch| {
            let Ok(timezone) = parse_timezone(&patch.timezone) else {
                return true;
            };
            let Ok(scheduler) = DateScheduler::new(timezone, &patch.start, &patch.end) else {
                // Cron form or malformed: retention does not apply
                return true;
            };
            let expiry = scheduler.end_time()
                + Duration::seconds(patch.retention_seconds.unwrap_or(0));
            now <= expiry
        })
        .collect();
    let changed = kept.len() != original_len;
    (kept, changed)
}
