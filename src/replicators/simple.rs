//! Simple replicator: max-aggregation plus one tuner pass
//!
//! Takes the largest desired replica count across all scaler outputs and
//! runs it through the selected tuner. Flux is the default; the
//! stabilizer or a raw pass-through can be selected per policy via
//! `replicatorSettings`. The replicator itself is stateless between
//! reconciles except through its tuners' memories.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{parse_plugin_config, Replicator, ReplicatorContext};
use crate::error::Error;
use crate::tuner::{FluxOptions, FluxTuner, Stabilizer, Tuner};

/// Which tuner damps the aggregated recommendation
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunerChoice {
    #[default]
    Flux,
    Stabilizer,
    None,
}

/// Per-policy settings carried in `spec.replicatorSettings`
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub tuner: TunerChoice,
    /// Opaque preference forwarded to the selected tuner
    pub preference: Option<serde_json::Value>,
}

/// Plugin configuration block
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleConfig {
    pub flux: FluxOptions,
}

/// Max-aggregating replicator with flux and stabilizer tuners
pub struct SimpleReplicator {
    flux: FluxTuner,
    stabilizer: Stabilizer,
}

impl SimpleReplicator {
    pub fn new(config: SimpleConfig) -> Self {
        Self {
            flux: FluxTuner::new(config.flux),
            stabilizer: Stabilizer::new(),
        }
    }

    fn load_settings(raw: Option<&serde_json::Value>) -> Settings {
        match raw {
            None => Settings::default(),
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|err| {
                warn!(error = %err, "invalid replicator settings, using defaults");
                Settings::default()
            }),
        }
    }
}

/// Constructor for the `simple` plugin
pub fn build(
    name: &'static str,
    raw: Option<&serde_yaml::Value>,
) -> Result<Arc<dyn Replicator>, Error> {
    let config: SimpleConfig = parse_plugin_config(name, raw)?;
    Ok(Arc::new(SimpleReplicator::new(config)))
}

impl Replicator for SimpleReplicator {
    fn desired_replicas(&self, ctx: ReplicatorContext<'_>) -> Result<i32, Error> {
        let settings = Self::load_settings(ctx.settings);

        let mut desired = 0;
        for (scaler, output) in ctx.scalers_output {
            debug!(
                key = ctx.key,
                scaler,
                desired_replicas = output.desired_replicas,
                "scaler output"
            );
            desired = desired.max(output.desired_replicas);
        }

        let tuned = match settings.tuner {
            TunerChoice::Flux => self.flux.recommend(
                ctx.key,
                ctx.current_replicas,
                desired,
                settings.preference.as_ref(),
            ),
            TunerChoice::Stabilizer => self.stabilizer.recommend(
                ctx.key,
                ctx.current_replicas,
                desired,
                settings.preference.as_ref(),
            ),
            TunerChoice::None => desired,
        };
        if tuned != desired {
            debug!(key = ctx.key, desired, tuned, "tuner adjusted recommendation");
        }
        Ok(tuned)
    }

    fn accept(&self, key: &str, current_replicas: i32, committed_replicas: i32) {
        self.flux.accept(key, current_replicas, committed_replicas);
        self.stabilizer
            .accept(key, current_replicas, committed_replicas);
    }

    fn forget(&self, key: &str) {
        self.flux.forget(key);
        self.stabilizer.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScalerOutput;
    use std::collections::HashMap;

    const KEY: &str = "api/default";

    fn outputs(entries: &[(&str, i32)]) -> HashMap<String, ScalerOutput> {
        entries
            .iter()
            .map(|(name, desired)| {
                (
                    name.to_string(),
                    ScalerOutput {
                        desired_replicas: *desired,
                        managed_target_status: Vec::new(),
                    },
                )
            })
            .collect()
    }

    fn context<'a>(
        outputs: &'a HashMap<String, ScalerOutput>,
        settings: Option<&'a serde_json::Value>,
        current: i32,
    ) -> ReplicatorContext<'a> {
        ReplicatorContext {
            key: KEY,
            current_replicas: current,
            settings,
            scalers_output: outputs,
        }
    }

    #[test]
    fn aggregation_takes_the_maximum() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        let outputs = outputs(&[("cpu", 3), ("prometheus", 7), ("rabbitmq", 5)]);
        let settings = serde_json::json!({"tuner": "none"});

        let desired = replicator
            .desired_replicas(context(&outputs, Some(&settings), 5))
            .unwrap();
        assert_eq!(desired, 7);
    }

    /// Story: three scalers agree the workload should triple from 10 to
    /// 30. The default flux tuner rations the jump to 50% growth per
    /// minute, so the first committed step is 15.
    #[test]
    fn flux_is_the_default_tuner() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        let outputs = outputs(&[("cpu", 30)]);

        let desired = replicator
            .desired_replicas(context(&outputs, None, 10))
            .unwrap();
        assert_eq!(desired, 15);
    }

    #[test]
    fn stabilizer_can_be_selected() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        let settings = serde_json::json!({"tuner": "stabilizer"});

        // Seed the stabilizer window with a high recommendation
        let high = outputs(&[("cpu", 12)]);
        replicator
            .desired_replicas(context(&high, Some(&settings), 10))
            .unwrap();

        let low = outputs(&[("cpu", 6)]);
        let desired = replicator
            .desired_replicas(context(&low, Some(&settings), 10))
            .unwrap();
        assert_eq!(desired, 12);
    }

    #[test]
    fn no_outputs_means_zero_desired() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        let outputs = HashMap::new();
        let settings = serde_json::json!({"tuner": "none"});

        let desired = replicator
            .desired_replicas(context(&outputs, Some(&settings), 4))
            .unwrap();
        assert_eq!(desired, 0);
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let settings = Some(serde_json::json!([1, 2, 3]));
        let parsed = SimpleReplicator::load_settings(settings.as_ref());
        assert_eq!(parsed.tuner, TunerChoice::Flux);
    }

    #[test]
    fn accept_feeds_the_flux_memories() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        replicator.accept(KEY, 10, 12);

        // The committed 12 now stabilizes a larger follow-up ask
        let outputs = outputs(&[("cpu", 30)]);
        let desired = replicator
            .desired_replicas(context(&outputs, None, 12))
            .unwrap();
        assert_eq!(desired, 12);
    }

    #[test]
    fn forget_clears_policy_state() {
        let replicator = SimpleReplicator::new(SimpleConfig::default());
        replicator.accept(KEY, 10, 12);
        replicator.forget(KEY);

        let outputs = outputs(&[("cpu", 30)]);
        let desired = replicator
            .desired_replicas(context(&outputs, None, 10))
            .unwrap();
        // No history: only the movement rule caps the jump
        assert_eq!(desired, 15);
    }
}
