//! Resource metrics facade
//!
//! Pod resource scalers consume per-pod CPU/memory samples through the
//! [`MetricsClient`] trait. The production implementation reads
//! `metrics.k8s.io/v1beta1` PodMetrics objects; tests mock the trait.
//! Every value is carried in milli-units so CPU cores and memory bytes
//! flow through the same ratio math.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::pods::Selector;

/// Pod resource a scaler can target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodResource {
    Cpu,
    Memory,
}

impl PodResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

/// One pod's metric sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodMetric {
    /// Usage in milli-units (millicores or millibytes)
    pub value: i64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Length of the collection window the sample covers
    pub window: Duration,
}

/// Per-pod metric samples keyed by pod name
pub type PodMetricsInfo = HashMap<String, PodMetric>;

/// Read access to the resource metrics backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Current samples for all pods in `namespace` matching `selector`
    async fn resource_metrics(
        &self,
        resource: PodResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<PodMetricsInfo, Error>;
}

/// Ratio of observed utilization over the target percentage.
///
/// Returns `(ratio, utilization_percent, raw_average_milli)` computed
/// over the pods present in both maps.
pub fn resource_utilization_ratio(
    metrics: &PodMetricsInfo,
    requests: &HashMap<String, i64>,
    target_utilization: i32,
) -> Result<(f64, i32, i64), Error> {
    let mut metrics_total: i64 = 0;
    let mut requests_total: i64 = 0;
    let mut entries: i64 = 0;
    for (pod, metric) in metrics {
        let Some(request) = requests.get(pod) else {
            // Missing requests are validated elsewhere; a metric without
            // a request is an extraneous sample.
            continue;
        };
        metrics_total += metric.value;
        requests_total += request;
        entries += 1;
    }
    if requests_total == 0 {
        return Err(Error::metrics("no metrics returned matched known pods"));
    }
    let utilization = ((metrics_total * 100) / requests_total) as i32;
    Ok((
        f64::from(utilization) / f64::from(target_utilization),
        utilization,
        metrics_total / entries,
    ))
}

/// Parse a Kubernetes quantity string into milli-units
pub fn parse_quantity_milli(quantity: &str) -> Result<i64, Error> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| Error::metrics(format!("invalid quantity `{quantity}`")))?;
    let milli_factor: f64 = match suffix {
        "n" => 1e-6,
        "u" => 1e-3,
        "m" => 1.0,
        "" => 1e3,
        "k" => 1e6,
        "M" => 1e9,
        "G" => 1e12,
        "T" => 1e15,
        "Ki" => 1024.0 * 1e3,
        "Mi" => 1024.0 * 1024.0 * 1e3,
        "Gi" => 1024.0 * 1024.0 * 1024.0 * 1e3,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1e3,
        _ => {
            return Err(Error::metrics(format!(
                "unsupported quantity suffix `{suffix}` in `{quantity}`"
            )))
        }
    };
    Ok((number * milli_factor).round() as i64)
}

/// Parse a metrics-server window such as `30s`, `1m30s` or `500ms`
fn parse_metric_window(window: &str) -> Duration {
    let mut total_ms: i64 = 0;
    let mut digits = String::new();
    let mut chars = window.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let Ok(value) = digits.parse::<i64>() else {
            return Duration::zero();
        };
        digits.clear();
        let unit_ms = match ch {
            'h' => 3_600_000,
            's' => 1_000,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    1
                } else {
                    60_000
                }
            }
            _ => return Duration::zero(),
        };
        total_ms += value * unit_ms;
    }
    Duration::milliseconds(total_ms)
}

/// Metrics client reading the `metrics.k8s.io` aggregated API
pub struct RestMetricsClient {
    client: Client,
}

impl RestMetricsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pod_metrics_api(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: "metrics.k8s.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "metrics.k8s.io/v1beta1".to_string(),
            kind: "PodMetrics".to_string(),
            plural: "pods".to_string(),
        };
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl MetricsClient for RestMetricsClient {
    async fn resource_metrics(
        &self,
        resource: PodResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<PodMetricsInfo, Error> {
        let mut params = ListParams::default();
        if !selector.as_str().is_empty() {
            params = params.labels(selector.as_str());
        }
        let list = self
            .pod_metrics_api(namespace)
            .list(&params)
            .await
            .map_err(|err| Error::metrics(format!("unable to fetch pod metrics: {err}")))?;

        let mut info = PodMetricsInfo::new();
        for item in list.items {
            let Some(name) = item.metadata.name.clone() else {
                continue;
            };
            let timestamp = item
                .data
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let window = item
                .data
                .get("window")
                .and_then(|v| v.as_str())
                .map(parse_metric_window)
                .unwrap_or_else(Duration::zero);

            let mut value: i64 = 0;
            let containers = item
                .data
                .get("containers")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for container in &containers {
                let Some(usage) = container
                    .get("usage")
                    .and_then(|u| u.get(resource.as_str()))
                    .and_then(|q| q.as_str())
                else {
                    continue;
                };
                value += parse_quantity_milli(usage)?;
            }
            info.insert(
                name,
                PodMetric {
                    value,
                    timestamp,
                    window,
                },
            );
        }
        Ok(info)
    }
}
