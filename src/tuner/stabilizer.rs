//! Stabilizer tuner: never recommend below a recent recommendation
//!
//! The stabilizer keeps a short history of raw recommendations per policy
//! key and returns the maximum over the applicable stabilization window.
//! It damps scale-down flapping while letting scale-ups through at full
//! speed.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

use super::memory::{ReplicaMemory, ReplicaSnapshot};
use super::Tuner;

const DEFAULT_STABILIZATION_SECONDS: i64 = 30;
const MEMORY_MAX_SIZE: usize = 100;
const MEMORY_RETENTION_SECONDS: i64 = 3600;

/// Per-policy stabilizer windows, in seconds
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StabilizerPreference {
    pub scale_up_stabilization_seconds: i64,
    pub scale_down_stabilization_seconds: i64,
}

impl Default for StabilizerPreference {
    fn default() -> Self {
        Self {
            scale_up_stabilization_seconds: DEFAULT_STABILIZATION_SECONDS,
            scale_down_stabilization_seconds: DEFAULT_STABILIZATION_SECONDS,
        }
    }
}

/// Tuner returning the max recommendation over the stabilization window
pub struct Stabilizer {
    memories: DashMap<String, Arc<ReplicaMemory>>,
}

impl Stabilizer {
    pub fn new() -> Self {
        Self {
            memories: DashMap::new(),
        }
    }

    fn memory(&self, key: &str) -> Arc<ReplicaMemory> {
        self.memories
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(ReplicaMemory::new(
                    MEMORY_MAX_SIZE,
                    Duration::seconds(MEMORY_RETENTION_SECONDS),
                ))
            })
            .clone()
    }

    fn load_preference(preference: Option<&serde_json::Value>) -> StabilizerPreference {
        preference
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}

impl Default for Stabilizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tuner for Stabilizer {
    fn name(&self) -> &'static str {
        "stabilizer"
    }

    fn recommend(
        &self,
        key: &str,
        current_replicas: i32,
        desired_replicas: i32,
        preference: Option<&serde_json::Value>,
    ) -> i32 {
        let preference = Self::load_preference(preference);
        let mut window_seconds = if desired_replicas > current_replicas {
            preference.scale_up_stabilization_seconds
        } else {
            preference.scale_down_stabilization_seconds
        };
        if window_seconds == 0 {
            window_seconds = DEFAULT_STABILIZATION_SECONDS;
        }

        let memory = self.memory(key);
        let cutoff = Utc::now() - Duration::seconds(window_seconds);
        let mut recommendation = desired_replicas;
        for snapshot in memory.since(cutoff, Duration::zero()) {
            recommendation = recommendation.max(snapshot.replicas);
        }
        if recommendation != desired_replicas {
            debug!(
                tuner = self.name(),
                key,
                desired_replicas,
                recommendation,
                "stabilized recommendation"
            );
        }

        memory.add(ReplicaSnapshot {
            timestamp: Utc::now(),
            replicas: desired_replicas,
        });
        recommendation
    }

    // The stabilizer records inside recommend; the committed value adds
    // no further signal.
    fn accept(&self, _key: &str, _current_replicas: i32, _committed_replicas: i32) {}

    fn forget(&self, key: &str) {
        self.memories.remove(key);
    }
}
