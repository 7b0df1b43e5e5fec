//! Bounded, retention-based log of replica snapshots

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// One observed or committed replica count at a point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub timestamp: DateTime<Utc>,
    pub replicas: i32,
}

/// Append-mostly log of replica snapshots ordered by timestamp.
///
/// The log never exceeds `max_size` entries and drops everything older
/// than `retention` on every mutation. Each instance carries its own lock
/// so it is safe to share across reconciler workers.
pub struct ReplicaMemory {
    entries: Mutex<Vec<ReplicaSnapshot>>,
    max_size: usize,
    retention: Duration,
}

impl ReplicaMemory {
    pub fn new(max_size: usize, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            retention,
        }
    }

    /// Insert a snapshot, expiring old entries and evicting the oldest
    /// entry when the log is full
    pub fn add(&self, snapshot: ReplicaSnapshot) {
        let cutoff = Utc::now() - self.retention;
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.timestamp >= cutoff);
        if entries.len() == self.max_size {
            entries.remove(0);
        }
        entries.push(snapshot);
        entries.sort_by_key(|entry| entry.timestamp);
    }

    /// All snapshots with `timestamp >= cutoff - jitter`
    pub fn since(&self, cutoff: DateTime<Utc>, jitter: Duration) -> Vec<ReplicaSnapshot> {
        let effective = cutoff - jitter;
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= effective)
            .copied()
            .collect()
    }

    /// The earliest snapshot with `timestamp > cutoff - jitter`
    pub fn first_after(&self, cutoff: DateTime<Utc>, jitter: Duration) -> Option<ReplicaSnapshot> {
        let effective = cutoff - jitter;
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.timestamp > effective)
            .copied()
    }

    /// Replica delta between the last and first snapshot in the window,
    /// zero when the window holds fewer than two snapshots
    pub fn delta_since(&self, cutoff: DateTime<Utc>, jitter: Duration) -> i32 {
        let window = self.since(cutoff, jitter);
        match (window.first(), window.last()) {
            (Some(first), Some(last)) if window.len() >= 2 => last.replicas - first.replicas,
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(age_seconds: i64, replicas: i32) -> ReplicaSnapshot {
        ReplicaSnapshot {
            timestamp: Utc::now() - Duration::seconds(age_seconds),
            replicas,
        }
    }

    #[test]
    fn keeps_entries_ordered_by_timestamp() {
        let memory = ReplicaMemory::new(10, Duration::hours(1));
        memory.add(snapshot(10, 3));
        memory.add(snapshot(30, 1));
        memory.add(snapshot(20, 2));

        let all = memory.since(Utc::now() - Duration::hours(1), Duration::zero());
        let replicas: Vec<i32> = all.iter().map(|s| s.replicas).collect();
        assert_eq!(replicas, vec![1, 2, 3]);
    }

    #[test]
    fn size_never_exceeds_the_maximum() {
        let memory = ReplicaMemory::new(3, Duration::hours(1));
        for i in 0..10 {
            memory.add(snapshot(10 - i, i as i32));
        }
        assert_eq!(memory.len(), 3);

        // The oldest entries were evicted first
        let remaining = memory.since(Utc::now() - Duration::hours(1), Duration::zero());
        let replicas: Vec<i32> = remaining.iter().map(|s| s.replicas).collect();
        assert_eq!(replicas, vec![7, 8, 9]);
    }

    #[test]
    fn expired_entries_are_dropped_on_insert() {
        let memory = ReplicaMemory::new(10, Duration::seconds(60));
        memory.add(snapshot(120, 5));
        memory.add(snapshot(5, 7));

        assert_eq!(memory.len(), 1);
        let remaining = memory.since(Utc::now() - Duration::hours(1), Duration::zero());
        assert_eq!(remaining[0].replicas, 7);
    }

    #[test]
    fn since_respects_cutoff_and_jitter() {
        let memory = ReplicaMemory::new(10, Duration::hours(1));
        memory.add(snapshot(100, 1));
        memory.add(snapshot(50, 2));
        memory.add(snapshot(10, 3));

        let cutoff = Utc::now() - Duration::seconds(55);
        assert_eq!(memory.since(cutoff, Duration::zero()).len(), 2);
        // 10 seconds of jitter pulls the 100s-old entry short of the
        // cutoff but admits nothing new; 50 seconds admits it.
        assert_eq!(memory.since(cutoff, Duration::seconds(10)).len(), 2);
        assert_eq!(memory.since(cutoff, Duration::seconds(50)).len(), 3);
    }

    #[test]
    fn first_after_returns_the_earliest_match() {
        let memory = ReplicaMemory::new(10, Duration::hours(1));
        memory.add(snapshot(100, 1));
        memory.add(snapshot(50, 2));
        memory.add(snapshot(10, 3));

        let found = memory
            .first_after(Utc::now() - Duration::seconds(60), Duration::zero())
            .unwrap();
        assert_eq!(found.replicas, 2);

        assert!(memory
            .first_after(Utc::now() + Duration::seconds(1), Duration::zero())
            .is_none());
    }

    #[test]
    fn delta_spans_first_to_last_in_window() {
        let memory = ReplicaMemory::new(10, Duration::hours(1));
        let cutoff = Utc::now() - Duration::seconds(120);

        assert_eq!(memory.delta_since(cutoff, Duration::zero()), 0);

        memory.add(snapshot(90, 4));
        // A single entry has no delta
        assert_eq!(memory.delta_since(cutoff, Duration::zero()), 0);

        memory.add(snapshot(60, 10));
        memory.add(snapshot(30, 7));
        assert_eq!(memory.delta_since(cutoff, Duration::zero()), 3);
    }

    #[test]
    fn concurrent_inserts_are_safe() {
        use std::sync::Arc;

        let memory = Arc::new(ReplicaMemory::new(100, Duration::hours(1)));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        memory.add(ReplicaSnapshot {
                            timestamp: Utc::now(),
                            replicas: worker * 100 + i,
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(memory.len(), 100);
    }
}
