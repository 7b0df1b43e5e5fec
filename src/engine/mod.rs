//! Plugin engine: registry, construction and lookup
//!
//! Plugins are declared as constructor functions in a static registry.
//! At startup the engine walks the controller configuration, builds every
//! configured plugin through its constructor, and keeps the built trait
//! objects; the registry is immutable afterwards. A configuration block
//! naming an unknown plugin aborts startup.

mod replicator;
mod scaler;

pub use replicator::{Replicator, ReplicatorContext};
pub use scaler::{Scaler, ScalerContext, ScalerOutput};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::Error;
use crate::metrics::MetricsClient;
use crate::pods::PodLister;

/// Shared services handed to plugin constructors
#[derive(Clone)]
pub struct PluginServices {
    pub pod_lister: Arc<dyn PodLister>,
    pub metrics: Arc<dyn MetricsClient>,
}

/// Builds a scaler from its raw configuration block
pub type ScalerBuilder =
    fn(&'static str, &PluginServices, Option<&serde_yaml::Value>) -> Result<Arc<dyn Scaler>, Error>;

/// Builds a replicator from its raw configuration block
pub type ReplicatorBuilder =
    fn(&'static str, Option<&serde_yaml::Value>) -> Result<Arc<dyn Replicator>, Error>;

/// Decode a plugin's raw configuration block, falling back to defaults
/// when the block is absent
pub fn parse_plugin_config<T>(plugin: &str, raw: Option<&serde_yaml::Value>) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    match raw {
        None => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|err| Error::config(format!("plugin `{plugin}`: {err}"))),
    }
}

/// Static table of known plugin constructors
#[derive(Default)]
pub struct PluginRegistry {
    scalers: HashMap<&'static str, ScalerBuilder>,
    replicators: HashMap<&'static str, ReplicatorBuilder>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scaler(&mut self, name: &'static str, builder: ScalerBuilder) {
        if self.scalers.insert(name, builder).is_some() {
            panic!("scaler plugin `{name}` registered twice");
        }
    }

    pub fn register_replicator(&mut self, name: &'static str, builder: ReplicatorBuilder) {
        if self.replicators.insert(name, builder).is_some() {
            panic!("replicator plugin `{name}` registered twice");
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.scalers.contains_key(name) || self.replicators.contains_key(name)
    }
}

/// All plugins shipped with the operator
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_scaler("cpu", crate::scalers::pod_resource::build_cpu);
    registry.register_scaler("memory", crate::scalers::pod_resource::build_memory);
    registry.register_scaler("prometheus", crate::scalers::prometheus::build);
    registry.register_scaler("rabbitmq", crate::scalers::rabbitmq::build);
    registry.register_replicator("simple", crate::replicators::simple::build);
    registry
}

/// Built plugins plus the shared services scalers run against
pub struct Engine {
    scalers: HashMap<String, Arc<dyn Scaler>>,
    replicators: HashMap<String, Arc<dyn Replicator>>,
    pub pod_lister: Arc<dyn PodLister>,
    pub metrics: Arc<dyn MetricsClient>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scalers", &self.scalers.keys().collect::<Vec<_>>())
            .field("replicators", &self.replicators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Engine {
    /// Build every configured plugin. Fails on unknown plugin names and
    /// on any constructor rejecting its configuration.
    pub fn new(
        registry: &PluginRegistry,
        plugin_configs: &BTreeMap<String, serde_yaml::Value>,
        services: PluginServices,
    ) -> Result<Self, Error> {
        let mut scalers: HashMap<String, Arc<dyn Scaler>> = HashMap::new();
        let mut replicators: HashMap<String, Arc<dyn Replicator>> = HashMap::new();

        for (name, raw_config) in plugin_configs {
            if let Some((&registered, builder)) = registry.scalers.get_key_value(name.as_str()) {
                info!(plugin = %name, "loading scaler plugin");
                scalers.insert(name.clone(), builder(registered, &services, Some(raw_config))?);
            } else if let Some((&registered, builder)) =
                registry.replicators.get_key_value(name.as_str())
            {
                info!(plugin = %name, "loading replicator plugin");
                replicators.insert(name.clone(), builder(registered, Some(raw_config))?);
            } else {
                return Err(Error::config(format!(
                    "unknown plugin `{name}` in controller configuration"
                )));
            }
        }

        // The default replicator is always available, with defaults,
        // even when the configuration does not mention it.
        if !replicators.contains_key(crate::crd::DEFAULT_REPLICATOR) {
            let builder = registry
                .replicators
                .get(crate::crd::DEFAULT_REPLICATOR)
                .ok_or_else(|| {
                    Error::config(format!(
                        "registry is missing the default replicator `{}`",
                        crate::crd::DEFAULT_REPLICATOR
                    ))
                })?;
            replicators.insert(
                crate::crd::DEFAULT_REPLICATOR.to_string(),
                builder(crate::crd::DEFAULT_REPLICATOR, None)?,
            );
        }

        Ok(Self {
            scalers,
            replicators,
            pod_lister: services.pod_lister,
            metrics: services.metrics,
        })
    }

    /// Assemble an engine from already-built plugins
    pub fn with_plugins(
        scalers: HashMap<String, Arc<dyn Scaler>>,
        replicators: HashMap<String, Arc<dyn Replicator>>,
        services: PluginServices,
    ) -> Self {
        Self {
            scalers,
            replicators,
            pod_lister: services.pod_lister,
            metrics: services.metrics,
        }
    }

    pub fn scaler(&self, name: &str) -> Option<Arc<dyn Scaler>> {
        self.scalers.get(name).cloned()
    }

    pub fn replicator(&self, name: &str) -> Option<Arc<dyn Replicator>> {
        self.replicators.get(name).cloned()
    }

    /// Drop all per-policy plugin state for `key`
    pub fn forget(&self, key: &str) {
        for replicator in self.replicators.values() {
            replicator.forget(key);
        }
    }
}
