//! Pending-pod exhaustion detection
//!
//! A workload is exhausted when more pods than the configured threshold
//! sit in the Pending phase and the oldest of them has waited longer
//! than the timeout. The verdict only feeds the `Exhausted` condition;
//! consumers read it to decide whether further scale-up is safe.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::crd::ExhaustPending;
use crate::error::Error;

/// Outcome of one exhaustion evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub exhausted: bool,
    pub pending_count: i32,
    pub oldest_pending_seconds: Option<i64>,
}

fn is_pending(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Pending")
        .unwrap_or(false)
}

/// Evaluate pending-pod exhaustion over the workload's pods at `now`
pub fn evaluate_pending_at(
    settings: &ExhaustPending,
    pods: &[Pod],
    current_replicas: i32,
    now: DateTime<Utc>,
) -> Result<Verdict, Error> {
    let threshold = settings.threshold.resolve(current_replicas, true)?;

    let mut pending_count = 0i32;
    let mut oldest_creation: Option<DateTime<Utc>> = None;
    for pod in pods.iter().filter(|pod| is_pending(pod)) {
        pending_count += 1;
        if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
            oldest_creation = Some(match oldest_creation {
                Some(current) => current.min(created.0),
                None => created.0,
            });
        }
    }

    let oldest_pending_seconds = oldest_creation.map(|created| (now - created).num_seconds());
    let timed_out = oldest_creation
        .map(|created| now - created > Duration::seconds(i64::from(settings.timeout_seconds)))
        .unwrap_or(false);

    Ok(Verdict {
        exhausted: pending_count > threshold && timed_out,
        pending_count,
        oldest_pending_seconds,
    })
}

/// Evaluate pending-pod exhaustion with the wall clock
pub fn evaluate_pending(
    settings: &ExhaustPending,
    pods: &[Pod],
    current_replicas: i32,
) -> Result<Verdict, Error> {
    evaluate_pending_at(settings, pods, current_replicas, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::IntOrPercent;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;

    fn pod(name: &str, phase: &str, age_seconds: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(Utc::now() - Duration::seconds(age_seconds))),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn settings(threshold: IntOrPercent, timeout_seconds: i32) -> ExhaustPending {
        ExhaustPending {
            threshold,
            timeout_seconds,
        }
    }

    /// Story: the cluster ran out of room. Three of five pods have been
    /// pending for ten minutes, well past the threshold of one and the
    /// 60-second timeout, so the workload is exhausted.
    #[test]
    fn stuck_pending_pods_exhaust_the_workload() {
        let pods = vec![
            pod("a", "Running", 600),
            pod("b", "Running", 600),
            pod("c", "Pending", 600),
            pod("d", "Pending", 300),
            pod("e", "Pending", 100),
        ];
        let verdict =
            evaluate_pending(&settings(IntOrPercent::Int(1), 60), &pods, 5).unwrap();
        assert!(verdict.exhausted);
        assert_eq!(verdict.pending_count, 3);
        assert!(verdict.oldest_pending_seconds.unwrap() >= 600);
    }

    #[test]
    fn young_pending_pods_are_tolerated() {
        let pods = vec![pod("a", "Running", 600), pod("b", "Pending", 10)];
        let verdict =
            evaluate_pending(&settings(IntOrPercent::Int(0), 60), &pods, 2).unwrap();
        assert!(!verdict.exhausted);
        assert_eq!(verdict.pending_count, 1);
    }

    #[test]
    fn counts_below_the_threshold_are_tolerated() {
        let pods = vec![pod("a", "Pending", 600)];
        let verdict =
            evaluate_pending(&settings(IntOrPercent::Int(1), 60), &pods, 2).unwrap();
        // One pending pod is not strictly above a threshold of one
        assert!(!verdict.exhausted);
    }

    #[test]
    fn percentage_thresholds_scale_with_replicas() {
        let pods = vec![
            pod("a", "Pending", 600),
            pod("b", "Pending", 600),
            pod("c", "Pending", 600),
        ];
        // 50% of 4 replicas = 2; three pending pods exceed it
        let verdict = evaluate_pending(
            &settings(IntOrPercent::Percent("50%".into()), 60),
            &pods,
            4,
        )
        .unwrap();
        assert!(verdict.exhausted);

        // 50% of 10 replicas = 5; three pending pods do not
        let verdict = evaluate_pending(
            &settings(IntOrPercent::Percent("50%".into()), 60),
            &pods,
            10,
        )
        .unwrap();
        assert!(!verdict.exhausted);
    }

    #[test]
    fn no_pending_pods_is_healthy() {
        let pods = vec![pod("a", "Running", 600)];
        let verdict =
            evaluate_pending(&settings(IntOrPercent::Int(0), 60), &pods, 1).unwrap();
        assert!(!verdict.exhausted);
        assert_eq!(verdict.pending_count, 0);
        assert!(verdict.oldest_pending_seconds.is_none());
    }
}
