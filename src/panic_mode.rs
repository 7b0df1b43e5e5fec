//! Panic mode predicates
//!
//! Panic mode shortens the reconcile cadence while a workload is
//! bursting: entered when the desired replica count outgrows the current
//! one beyond a configured ratio, and held for a fixed window after the
//! last transition. Panic mode also bypasses the scaling cooldown.

use chrono::{DateTime, Duration, Utc};

use crate::crd::{ConditionStatus, ConditionType, ReplicaAutoscalerStatus, Strategy};

/// Panic mode requires both the threshold and the window to be set
pub fn configured(strategy: Option<&Strategy>) -> bool {
    strategy
        .map(|s| s.panic_threshold.is_some() && s.panic_window_seconds.is_some())
        .unwrap_or(false)
}

/// Should this cycle enter panic mode?
pub fn should_enter(strategy: Option<&Strategy>, desired_replicas: i32, current_replicas: i32) -> bool {
    // Scaling down or staying at zero never panics
    if !configured(strategy) || desired_replicas == 0 {
        return false;
    }
    // Scaling from zero is always a burst: the first replicas must come
    // up as fast as possible
    if current_replicas == 0 {
        return true;
    }
    let threshold = strategy
        .and_then(|s| s.panic_threshold)
        .expect("configured() checked the threshold");
    f64::from(desired_replicas) / f64::from(current_replicas) >= threshold
}

/// Is a previously entered panic window still open at `now`?
pub fn still_in_at(
    status: &ReplicaAutoscalerStatus,
    strategy: Option<&Strategy>,
    now: DateTime<Utc>,
) -> bool {
    if !configured(strategy) {
        return false;
    }
    let window_seconds = strategy
        .and_then(|s| s.panic_window_seconds)
        .expect("configured() checked the window");
    match status.condition(ConditionType::PanicMode) {
        Some(condition) if condition.status == ConditionStatus::True => {
            now - condition.last_transition_time < Duration::seconds(i64::from(window_seconds))
        }
        _ => false,
    }
}

/// Is a previously entered panic window still open?
pub fn still_in(status: &ReplicaAutoscalerStatus, strategy: Option<&Strategy>) -> bool {
    still_in_at(status, strategy, Utc::now())
}
