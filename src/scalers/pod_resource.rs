//! Pod resource scaler (`cpu` / `memory`)
//!
//! Computes desired replicas from per-pod resource utilization against
//! the requested amount. Pods are partitioned by readiness first; unready
//! and ignored pods lose their samples, and missing or unready pods are
//! imputed conservatively before a second pass so a burst of pending pods
//! cannot flip the scale direction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::ResourceExt;
use serde::Deserialize;
use tracing::info;

use crate::crd::{MetricTarget, MetricTargetType, TargetStatus};
use crate::engine::{parse_plugin_config, PluginServices, Scaler, ScalerContext, ScalerOutput};
use crate::error::Error;
use crate::metrics::{
    parse_quantity_milli, resource_utilization_ratio, MetricsClient, PodMetricsInfo, PodResource,
};
use crate::pods::PodLister;

/// Pods younger than this may still be initializing; their samples are
/// held to a stricter readiness bar
fn possible_initialization_period() -> Duration {
    Duration::seconds(10)
}

/// Grace between container start and the first trusted readiness signal
fn initial_readiness_delay() -> Duration {
    Duration::seconds(3)
}

const DEFAULT_UTILIZATION_TOLERATION: f64 = 0.05;

/// Plugin configuration for both resource scalers
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Relative band around the target within which no scaling happens
    pub utilization_toleration: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            utilization_toleration: DEFAULT_UTILIZATION_TOLERATION,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.utilization_toleration < DEFAULT_UTILIZATION_TOLERATION
            || self.utilization_toleration > 1.0
        {
            return Err(Error::config(
                "pod resource utilization toleration must be within [0.05, 1]",
            ));
        }
        Ok(())
    }
}

/// Per-target settings payload
#[derive(Clone, Copy, Debug, Deserialize)]
struct Settings {
    /// Target average utilization as a percentage of requests
    utilization: i32,
}

/// Scaler over one pod resource
pub struct PodResourceScaler {
    plugin_name: &'static str,
    resource: PodResource,
    config: Config,
}

impl PodResourceScaler {
    pub fn new(
        plugin_name: &'static str,
        resource: PodResource,
        config: Config,
    ) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|err| Error::config(format!("plugin `{plugin_name}`: {err}")))?;
        Ok(Self {
            plugin_name,
            resource,
            config,
        })
    }
}

/// Constructor for the `cpu` plugin
pub fn build_cpu(
    name: &'static str,
    _services: &PluginServices,
    raw: Option<&serde_yaml::Value>,
) -> Result<Arc<dyn Scaler>, Error> {
    let config = parse_plugin_config(name, raw)?;
    Ok(Arc::new(PodResourceScaler::new(
        name,
        PodResource::Cpu,
        config,
    )?))
}

/// Constructor for the `memory` plugin
pub fn build_memory(
    name: &'static str,
    _services: &PluginServices,
    raw: Option<&serde_yaml::Value>,
) -> Result<Arc<dyn Scaler>, Error> {
    let config = parse_plugin_config(name, raw)?;
    Ok(Arc::new(PodResourceScaler::new(
        name,
        PodResource::Memory,
        config,
    )?))
}

#[async_trait]
impl Scaler for PodResourceScaler {
    async fn get(&self, ctx: ScalerContext<'_>) -> Result<ScalerOutput, Error> {
        let settings: Settings = ctx.settings()?;
        let pods = ctx.pod_lister.list(ctx.namespace, ctx.selector)?;
        if pods.is_empty() {
            info!(
                plugin = self.plugin_name,
                namespace = ctx.namespace,
                "no pods found by selector, keeping current replicas"
            );
            return Ok(ScalerOutput {
                desired_replicas: ctx.current_replicas,
                managed_target_status: Vec::new(),
            });
        }

        let metrics = ctx
            .metrics
            .resource_metrics(self.resource, ctx.namespace, ctx.selector)
            .await?;

        let (desired_replicas, utilization, _) = tidy_and_calculate_desired_replicas(
            self.config.utilization_toleration,
            metrics,
            &pods,
            self.resource,
            settings.utilization,
            ctx.current_replicas,
            Utc::now(),
        )?;

        ctx.status.set_target_status(TargetStatus {
            target: self.plugin_name.to_string(),
            scaler: self.plugin_name.to_string(),
            desired_replicas,
            metric: MetricTarget {
                type_: MetricTargetType::Utilization,
                average_utilization: Some(utilization),
                ..Default::default()
            },
        });
        Ok(ScalerOutput {
            desired_replicas,
            managed_target_status: vec![self.plugin_name.to_string()],
        })
    }
}

fn pod_condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

/// Partition pods into ready / unready / missing-metric / ignored.
///
/// Deleting and failed pods are ignored outright and pending pods count
/// as unready. For CPU the readiness condition is checked against the
/// pod's age: within the possible-initialization period a sample is also
/// rejected when its window predates the last readiness transition;
/// afterwards only never-ready pods stay unready.
fn group_pods(
    pods: &[Pod],
    metrics: &PodMetricsInfo,
    resource: PodResource,
    now: DateTime<Utc>,
) -> (
    usize,
    HashSet<String>,
    HashSet<String>,
    HashSet<String>,
) {
    let mut ready_count = 0usize;
    let mut unready = HashSet::new();
    let mut missing = HashSet::new();
    let mut ignored = HashSet::new();

    for pod in pods {
        let name = pod.name_any();
        if pod.metadata.deletion_timestamp.is_some() || pod_phase(pod) == "Failed" {
            ignored.insert(name);
            continue;
        }
        if pod_phase(pod) == "Pending" {
            unready.insert(name);
            continue;
        }
        let Some(metric) = metrics.get(&name) else {
            missing.insert(name);
            continue;
        };
        if resource == PodResource::Cpu {
            let condition = pod_condition(pod, "Ready");
            let start_time = pod.status.as_ref().and_then(|s| s.start_time.as_ref());
            let pod_unready = match (condition, start_time) {
                (Some(condition), Some(start)) => {
                    let condition_false = condition.status == "False";
                    let last_transition = condition
                        .last_transition_time
                        .as_ref()
                        .map(|t| t.0)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    if start.0 + possible_initialization_period() > now {
                        condition_false || metric.timestamp < last_transition + metric.window
                    } else {
                        condition_false && start.0 + initial_readiness_delay() > last_transition
                    }
                }
                _ => true,
            };
            if pod_unready {
                unready.insert(name);
                continue;
            }
        }
        ready_count += 1;
    }
    (ready_count, unready, missing, ignored)
}

fn remove_metrics_for_pods(metrics: &mut PodMetricsInfo, pods: &HashSet<String>) {
    for pod in pods {
        metrics.remove(pod);
    }
}

/// Sum of container requests for `resource` per pod, in milli-units
fn calculate_pod_requests(
    pods: &[Pod],
    resource: PodResource,
) -> Result<HashMap<String, i64>, Error> {
    let mut requests = HashMap::with_capacity(pods.len());
    for pod in pods {
        let mut pod_sum = 0i64;
        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();
        for container in containers {
            let request = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get(resource.as_str()));
            match request {
                Some(quantity) => pod_sum += parse_quantity_milli(&quantity.0)?,
                None => {
                    return Err(Error::scaler(format!(
                        "missing request for {}",
                        resource.as_str()
                    )))
                }
            }
        }
        requests.insert(pod.name_any(), pod_sum);
    }
    Ok(requests)
}

#[allow(clippy::too_many_arguments)]
fn tidy_and_calculate_desired_replicas(
    toleration: f64,
    mut metrics: PodMetricsInfo,
    pods: &[Pod],
    resource: PodResource,
    target_utilization: i32,
    current_replicas: i32,
    now: DateTime<Utc>,
) -> Result<(i32, i32, i64), Error> {
    let (ready_count, unready, missing, ignored) = group_pods(pods, &metrics, resource, now);
    remove_metrics_for_pods(&mut metrics, &ignored);
    remove_metrics_for_pods(&mut metrics, &unready);
    let requests = calculate_pod_requests(pods, resource)?;

    if metrics.is_empty() {
        return Err(Error::scaler("did not receive metrics for any ready pods"));
    }

    let (usage_ratio, utilization, raw_average) =
        resource_utilization_ratio(&metrics, &requests, target_utilization)?;

    let rebalance_unready = !unready.is_empty() && usage_ratio > 1.0;

    if !rebalance_unready && missing.is_empty() {
        if (1.0 - usage_ratio).abs() <= toleration {
            // The change would be too small to act on
            return Ok((current_replicas, utilization, raw_average));
        }
        return Ok((
            (usage_ratio * ready_count as f64).ceil() as i32,
            utilization,
            raw_average,
        ));
    }

    if !missing.is_empty() {
        if usage_ratio < 1.0 {
            // On scale-down, missing pods are assumed to use their full request
            for pod in &missing {
                let request = requests.get(pod).copied().unwrap_or(0);
                metrics.insert(
                    pod.clone(),
                    crate::metrics::PodMetric {
                        value: request,
                        timestamp: now,
                        window: Duration::zero(),
                    },
                );
            }
        } else if usage_ratio > 1.0 {
            // On scale-up, missing pods are assumed idle. At exactly the
            // target there is no direction to impute for; the samples
            // stay untouched and the recompute holds position.
            for pod in &missing {
                metrics.insert(
                    pod.clone(),
                    crate::metrics::PodMetric {
                        value: 0,
                        timestamp: now,
                        window: Duration::zero(),
                    },
                );
            }
        }
    }

    if rebalance_unready {
        // On scale-up, unready pods are assumed idle
        for pod in &unready {
            metrics.insert(
                pod.clone(),
                crate::metrics::PodMetric {
                    value: 0,
                    timestamp: now,
                    window: Duration::zero(),
                },
            );
        }
    }

    let (new_usage_ratio, _, _) =
        resource_utilization_ratio(&metrics, &requests, target_utilization)?;

    if (1.0 - new_usage_ratio).abs() <= toleration
        || (usage_ratio < 1.0 && new_usage_ratio > 1.0)
        || (usage_ratio > 1.0 && new_usage_ratio < 1.0)
    {
        // Too small a change, or the imputed values flipped the direction
        return Ok((current_replicas, utilization, raw_average));
    }

    let new_replicas = (new_usage_ratio * metrics.len() as f64).ceil() as i32;
    if (new_usage_ratio < 1.0 && new_replicas > current_replicas)
        || (new_usage_ratio > 1.0 && new_replicas < current_replicas)
    {
        // The recount would flip the direction; hold position
        return Ok((current_replicas, utilization, raw_average));
    }

    Ok((new_replicas, utilization, raw_average))
}
