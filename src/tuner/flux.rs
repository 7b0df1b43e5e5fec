//! Flux tuner: rate-limits replica movement with per-direction rules
//!
//! Flux keeps two histories per policy key, one of committed scale-up
//! decisions and one of scale-downs. A recommendation is first stabilized
//! against the window of recent decisions in its direction, then capped
//! by per-rule movement limits (absolute count or percentage over a
//! period), and finally clamped between the current replicas and the raw
//! desired value so the tuner can never widen the gap it was asked to
//! close.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::memory::{ReplicaMemory, ReplicaSnapshot};
use super::Tuner;
use crate::crd::IntOrPercent;

/// Movement rule kind
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RuleType {
    /// Allow at most `value` replicas of movement per period
    ReplicaCount,
    /// Allow at most `value` percent of movement per period
    ReplicaPercent,
}

/// How multiple rule candidates combine into one limit
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RuleStrategy {
    /// Pick the most permissive candidate
    Max,
    /// Pick the most restrictive candidate
    Min,
}

/// One movement rule
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxRule {
    #[serde(rename = "type")]
    pub type_: RuleType,
    /// Positive count or percentage (`50` or `"50%"`)
    pub value: IntOrPercent,
    /// Lookback period the rule base is taken from
    pub period_seconds: i64,
}

/// Rules plus the strategy combining them
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxRuleSet {
    /// Per-policy stabilization window override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_window_seconds: Option<i64>,
    pub strategy: RuleStrategy,
    pub rules: Vec<FluxRule>,
}

/// Per-policy flux preference carried in replicator settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FluxPreference {
    pub scale_up_rule_set: Option<FluxRuleSet>,
    pub scale_down_rule_set: Option<FluxRuleSet>,
}

fn default_scale_up_rule_set() -> FluxRuleSet {
    FluxRuleSet {
        stabilization_window_seconds: None,
        strategy: RuleStrategy::Max,
        rules: vec![FluxRule {
            type_: RuleType::ReplicaPercent,
            value: IntOrPercent::Int(50),
            period_seconds: 60,
        }],
    }
}

fn default_scale_down_rule_set() -> FluxRuleSet {
    FluxRuleSet {
        stabilization_window_seconds: None,
        strategy: RuleStrategy::Min,
        rules: vec![FluxRule {
            type_: RuleType::ReplicaPercent,
            value: IntOrPercent::Int(50),
            period_seconds: 60,
        }],
    }
}

/// Flux tuner configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FluxOptions {
    /// Bound of each per-key replica memory
    pub replica_memory_max_size: usize,
    /// Retention of each per-key replica memory, in seconds
    pub replica_memory_retention_seconds: i64,
    /// Jitter toleration applied to every memory cutoff read
    pub memory_cutoff_jitter_toleration_seconds: i64,
    pub scale_up_stabilization_seconds: i64,
    pub scale_down_stabilization_seconds: i64,
    /// Preference applied when the policy carries none
    pub default_preference: FluxPreference,
}

impl Default for FluxOptions {
    fn default() -> Self {
        Self {
            replica_memory_max_size: 2000,
            replica_memory_retention_seconds: 3600,
            memory_cutoff_jitter_toleration_seconds: 10,
            scale_up_stabilization_seconds: 180,
            scale_down_stabilization_seconds: 300,
            default_preference: FluxPreference {
                scale_up_rule_set: Some(default_scale_up_rule_set()),
                scale_down_rule_set: Some(default_scale_down_rule_set()),
            },
        }
    }
}

impl FluxOptions {
    /// Replace zeroed or missing fields with the defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.replica_memory_max_size == 0 {
            self.replica_memory_max_size = defaults.replica_memory_max_size;
        }
        if self.replica_memory_retention_seconds <= 0 {
            self.replica_memory_retention_seconds = defaults.replica_memory_retention_seconds;
        }
        if self.memory_cutoff_jitter_toleration_seconds <= 0 {
            self.memory_cutoff_jitter_toleration_seconds =
                defaults.memory_cutoff_jitter_toleration_seconds;
        }
        if self.scale_up_stabilization_seconds <= 0 {
            self.scale_up_stabilization_seconds = defaults.scale_up_stabilization_seconds;
        }
        if self.scale_down_stabilization_seconds <= 0 {
            self.scale_down_stabilization_seconds = defaults.scale_down_stabilization_seconds;
        }
        if self
            .default_preference
            .scale_up_rule_set
            .as_ref()
            .map(|set| set.rules.is_empty())
            .unwrap_or(true)
        {
            self.default_preference.scale_up_rule_set = Some(default_scale_up_rule_set());
        }
        if self
            .default_preference
            .scale_down_rule_set
            .as_ref()
            .map(|set| set.rules.is_empty())
            .unwrap_or(true)
        {
            self.default_preference.scale_down_rule_set = Some(default_scale_down_rule_set());
        }
        self
    }
}

enum Direction {
    Up,
    Down,
}

/// Rate-limiting tuner with independent scale-up and scale-down memories
pub struct FluxTuner {
    options: FluxOptions,
    scale_up_memory: DashMap<String, Arc<ReplicaMemory>>,
    scale_down_memory: DashMap<String, Arc<ReplicaMemory>>,
}

impl FluxTuner {
    pub fn new(options: FluxOptions) -> Self {
        Self {
            options: options.normalized(),
            scale_up_memory: DashMap::new(),
            scale_down_memory: DashMap::new(),
        }
    }

    fn memory(&self, direction: &Direction, key: &str) -> Arc<ReplicaMemory> {
        let map = match direction {
            Direction::Up => &self.scale_up_memory,
            Direction::Down => &self.scale_down_memory,
        };
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(ReplicaMemory::new(
                    self.options.replica_memory_max_size,
                    Duration::seconds(self.options.replica_memory_retention_seconds),
                ))
            })
            .clone()
    }

    fn jitter(&self) -> Duration {
        Duration::seconds(self.options.memory_cutoff_jitter_toleration_seconds)
    }

    fn load_preference(&self, preference: Option<&serde_json::Value>) -> FluxPreference {
        let mut loaded = preference
            .and_then(|value| serde_json::from_value::<FluxPreference>(value.clone()).ok())
            .unwrap_or_default();
        if loaded
            .scale_up_rule_set
            .as_ref()
            .map(|set| set.rules.is_empty())
            .unwrap_or(true)
        {
            loaded.scale_up_rule_set = self.options.default_preference.scale_up_rule_set.clone();
        }
        if loaded
            .scale_down_rule_set
            .as_ref()
            .map(|set| set.rules.is_empty())
            .unwrap_or(true)
        {
            loaded.scale_down_rule_set =
                self.options.default_preference.scale_down_rule_set.clone();
        }
        loaded
    }

    /// Limit candidate for one rule: the movement allowance applied on
    /// top of the replica base observed at the start of the rule period
    fn rule_candidate(
        &self,
        direction: &Direction,
        memory: &ReplicaMemory,
        current_replicas: i32,
        rule: &FluxRule,
        now: DateTime<Utc>,
    ) -> Option<i32> {
        let value = match rule.value.resolve(100, true) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "invalid flux rule value, rule skipped");
                return None;
            }
        };
        let cutoff = now - Duration::seconds(rule.period_seconds);
        let base = memory
            .first_after(cutoff, self.jitter())
            .map(|snapshot| snapshot.replicas)
            .unwrap_or(current_replicas);
        let movement = match rule.type_ {
            RuleType::ReplicaCount => value,
            // Integer ceil of base * value / 100
            RuleType::ReplicaPercent => (base * value + 99) / 100,
        };
        Some(match direction {
            Direction::Up => base + movement,
            Direction::Down => base - movement,
        })
    }

    fn movement_limit(
        &self,
        direction: &Direction,
        memory: &ReplicaMemory,
        current_replicas: i32,
        rule_set: &FluxRuleSet,
        now: DateTime<Utc>,
    ) -> Option<i32> {
        let mut limit: Option<i32> = None;
        // Max strategy keeps the most permissive candidate: the largest
        // limit going up, the smallest going down.
        for rule in &rule_set.rules {
            let Some(candidate) =
                self.rule_candidate(direction, memory, current_replicas, rule, now)
            else {
                continue;
            };
            limit = Some(match (limit, direction, rule_set.strategy) {
                (None, _, _) => candidate,
                (Some(prev), Direction::Up, RuleStrategy::Max) => prev.max(candidate),
                (Some(prev), Direction::Up, RuleStrategy::Min) => prev.min(candidate),
                (Some(prev), Direction::Down, RuleStrategy::Max) => prev.min(candidate),
                (Some(prev), Direction::Down, RuleStrategy::Min) => prev.max(candidate),
            });
        }
        if limit.is_none() {
            warn!("no effective flux rule, movement limit not applied");
        }
        limit
    }
}

impl Tuner for FluxTuner {
    fn name(&self) -> &'static str {
        "flux"
    }

    fn recommend(
        &self,
        key: &str,
        current_replicas: i32,
        desired_replicas: i32,
        preference: Option<&serde_json::Value>,
    ) -> i32 {
        if desired_replicas == current_replicas {
            return desired_replicas;
        }
        let preference = self.load_preference(preference);
        let now = Utc::now();
        let raw_desired = desired_replicas;
        let mut desired = desired_replicas;

        if desired > current_replicas {
            let memory = self.memory(&Direction::Up, key);
            let rule_set = preference
                .scale_up_rule_set
                .expect("default scale-up rule set is always present");

            let window = rule_set
                .stabilization_window_seconds
                .unwrap_or(self.options.scale_up_stabilization_seconds);
            let snapshots = memory.since(now - Duration::seconds(window), self.jitter());
            if let Some(stable) = snapshots.iter().map(|s| s.replicas).min() {
                // Recent scale-ups below the ask hold this one down
                desired = desired.min(stable);
            }

            if let Some(limit) =
                self.movement_limit(&Direction::Up, &memory, current_replicas, &rule_set, now)
            {
                if desired > limit {
                    debug!(key, limit, "scale up limit reached");
                    desired = limit;
                }
            }
            desired = desired.clamp(current_replicas, raw_desired);
        } else {
            let memory = self.memory(&Direction::Down, key);
            let rule_set = preference
                .scale_down_rule_set
                .expect("default scale-down rule set is always present");

            let window = rule_set
                .stabilization_window_seconds
                .unwrap_or(self.options.scale_down_stabilization_seconds);
            let snapshots = memory.since(now - Duration::seconds(window), self.jitter());
            if let Some(stable) = snapshots.iter().map(|s| s.replicas).max() {
                desired = desired.max(stable);
            }

            if let Some(limit) =
                self.movement_limit(&Direction::Down, &memory, current_replicas, &rule_set, now)
            {
                if desired < limit {
                    debug!(key, limit, "scale down limit reached");
                    desired = limit;
                }
            }
            desired = desired.clamp(raw_desired, current_replicas);
        }

        debug!(
            tuner = self.name(),
            key, current_replicas, raw_desired, desired, "flux recommendation"
        );
        desired
    }

    fn accept(&self, key: &str, current_replicas: i32, committed_replicas: i32) {
        let snapshot = ReplicaSnapshot {
            timestamp: Utc::now(),
            replicas: committed_replicas,
        };
        if current_replicas < committed_replicas {
            self.memory(&Direction::Up, key).add(snapshot);
        } else if current_replicas > committed_replicas {
            self.memory(&Direction::Down, key).add(snapshot);
        } else {
            // A hold is signal for both directions
            self.memory(&Direction::Up, key).add(snapshot);
            self.memory(&Direction::Down, key).add(snapshot);
        }
    }

    fn forget(&self, key: &str) {
        self.scale_up_memory.remove(key);
        self.scale_down_memory.remove(key);
    }
}
