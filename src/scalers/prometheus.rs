//! Prometheus vector-query scaler
//!
//! Runs one instant query per cycle and converts the scalar result into
//! a replica recommendation through the average/threshold formula. The
//! failure mode decides what happens when the query fails: abort, treat
//! as zero, or fall back to the last average value stored in status.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::crd::{MetricTarget, MetricTargetType, TargetStatus};
use crate::engine::{PluginServices, Scaler, ScalerContext, ScalerOutput};
use crate::error::Error;
use crate::metrics::parse_quantity_milli;

const DEFAULT_TOLERATION: f64 = 0.05;
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Prometheus server coordinates and authentication
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    /// Base address, e.g. `http://prometheus.monitoring:9090`
    pub server_address: Option<String>,
    /// Skip TLS verification
    pub insecure_ssl: Option<bool>,
    /// Bearer token authentication
    pub bearer_token: Option<String>,
    /// Basic authentication
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Plugin configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    /// Relative band around the threshold within which no scaling happens
    pub toleration: f64,
    /// Query timeout in seconds
    pub default_timeout_seconds: u64,
    /// Server used when the target settings carry none
    pub default_server: Server,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            toleration: DEFAULT_TOLERATION,
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            default_server: Server::default(),
        }
    }
}

impl PrometheusConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.toleration < 0.0 {
            return Err(Error::config("toleration must be non-negative"));
        }
        if self.default_server.server_address.is_none() {
            return Err(Error::config("default server is required"));
        }
        Ok(())
    }
}

/// What to do when the query fails
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum FailureMode {
    /// Abort the reconcile; nothing scales this cycle
    #[default]
    #[serde(alias = "")]
    FailAsError,
    /// Treat the metric as zero
    FailAsZero,
    /// Reuse the last average value stored in status; abort when absent.
    /// The stored value is keyed by a hash of the query, so editing the
    /// query invalidates the fallback.
    FailAsLastValue,
}

/// Per-target settings payload
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(flatten)]
    pub server: Server,

    /// Single positive vector response query
    pub query: String,

    /// Per-replica average the metric is held to
    pub threshold: f64,

    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.query.is_empty() {
            return Err(Error::validation("query is empty"));
        }
        if self.threshold <= 0.0 {
            return Err(Error::validation("threshold must be positive"));
        }
        Ok(())
    }
}

/// Executes instant queries against a Prometheus-compatible endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// The scalar value of a single-sample vector response; an empty
    /// vector reads as zero
    async fn query(
        &self,
        server: &Server,
        query: &str,
        when: DateTime<Utc>,
    ) -> Result<f64, Error>;
}

#[derive(Deserialize)]
struct VectorResponse {
    status: String,
    #[serde(default)]
    data: VectorData,
}

#[derive(Default, Deserialize)]
struct VectorData {
    #[serde(default, rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

/// HTTP query client with separate verified and unverified TLS stacks
pub struct HttpQueryClient {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl HttpQueryClient {
    pub fn new(timeout: StdDuration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::config(format!("unable to build http client: {err}")))?;
        let insecure_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| Error::config(format!("unable to build http client: {err}")))?;
        Ok(Self {
            client,
            insecure_client,
        })
    }
}

#[async_trait]
impl QueryClient for HttpQueryClient {
    async fn query(
        &self,
        server: &Server,
        query: &str,
        when: DateTime<Utc>,
    ) -> Result<f64, Error> {
        let address = server
            .server_address
            .as_deref()
            .ok_or_else(|| Error::query("prometheus server address is not configured"))?;
        let url = format!("{}/api/v1/query", address.trim_end_matches('/'));

        let client = if server.insecure_ssl.unwrap_or(false) {
            &self.insecure_client
        } else {
            &self.client
        };
        let mut request = client
            .get(url)
            .query(&[("query", query), ("time", &when.to_rfc3339())]);
        if let Some(token) = &server.bearer_token {
            request = request.bearer_auth(token);
        } else if let Some(username) = &server.username {
            request = request.basic_auth(username, server.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|err| Error::query(format!("prometheus request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| Error::query(format!("prometheus response unreadable: {err}")))?;
        if !status.is_success() {
            return Err(Error::query(format!(
                "prometheus server `{address}` returned status {status}: `{body}`"
            )));
        }

        let vector: VectorResponse = serde_json::from_str(&body)
            .map_err(|err| Error::query(format!("invalid prometheus response: {err}")))?;
        if vector.status != "success" {
            return Err(Error::query(format!(
                "prometheus query status `{}`",
                vector.status
            )));
        }
        if !vector.data.result_type.is_empty() && vector.data.result_type != "vector" {
            return Err(Error::query(format!(
                "expected a vector response, got `{}`",
                vector.data.result_type
            )));
        }
        match vector.data.result.as_slice() {
            [] => Ok(0.0),
            [sample] => sample
                .value
                .1
                .parse()
                .map_err(|err| Error::query(format!("invalid sample value: {err}"))),
            _ => Err(Error::query("this query returns multiple series")),
        }
    }
}

/// Scaler driving replicas from one Prometheus query
pub struct PrometheusScaler {
    plugin_name: &'static str,
    config: PrometheusConfig,
    query_client: Box<dyn QueryClient>,
}

impl PrometheusScaler {
    pub fn new(plugin_name: &'static str, config: PrometheusConfig) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|err| Error::config(format!("plugin `{plugin_name}`: {err}")))?;
        let query_client = Box::new(HttpQueryClient::new(StdDuration::from_secs(
            config.default_timeout_seconds,
        ))?);
        Ok(Self {
            plugin_name,
            config,
            query_client,
        })
    }

    /// Constructor with an injected query client
    pub fn with_query_client(
        plugin_name: &'static str,
        config: PrometheusConfig,
        query_client: Box<dyn QueryClient>,
    ) -> Self {
        Self {
            plugin_name,
            config,
            query_client,
        }
    }

    /// Status record name: plugin plus a stable hash of the query
    fn target_status_name(&self, query: &str) -> String {
        let digest = xxhash_rust::xxh3::xxh3_128(query.as_bytes());
        format!("{}/{digest:032x}", self.plugin_name)
    }
}

/// Constructor for the `prometheus` plugin
pub fn build(
    name: &'static str,
    _services: &PluginServices,
    raw: Option<&serde_yaml::Value>,
) -> Result<Arc<dyn Scaler>, Error> {
    let raw = raw.ok_or_else(|| Error::config(format!("plugin `{name}` requires configuration")))?;
    let config: PrometheusConfig = serde_yaml::from_value(raw.clone())
        .map_err(|err| Error::config(format!("plugin `{name}`: {err}")))?;
    Ok(Arc::new(PrometheusScaler::new(name, config)?))
}

#[async_trait]
impl Scaler for PrometheusScaler {
    async fn get(&self, ctx: ScalerContext<'_>) -> Result<ScalerOutput, Error> {
        let settings: Settings = ctx.settings()?;
        settings.validate()?;

        if ctx.current_replicas == 0 {
            // A parked workload stays parked; wake-up is the operator's call
            return Ok(ScalerOutput {
                desired_replicas: 0,
                managed_target_status: Vec::new(),
            });
        }

        let server = if settings.server.server_address.is_some() {
            settings.server.clone()
        } else {
            self.config.default_server.clone()
        };
        let target_status_name = self.target_status_name(&settings.query);

        let mut average_value: Option<f64> = None;
        let mut should_update_average = true;
        let value = match self
            .query_client
            .query(&server, &settings.query, Utc::now())
            .await
        {
            Ok(value) => value,
            Err(err) => {
                // Never overwrite the stored average with failure data
                should_update_average = false;
                match settings.failure_mode {
                    FailureMode::FailAsError => return Err(err),
                    FailureMode::FailAsZero => 0.0,
                    FailureMode::FailAsLastValue => {
                        let last = ctx
                            .status
                            .target_status(&target_status_name)
                            .and_then(|status| status.metric.average_value.as_deref())
                            .and_then(|quantity| parse_quantity_milli(quantity).ok())
                            .map(|milli| milli as f64 / 1000.0);
                        match last {
                            Some(last_average) => {
                                average_value = Some(last_average);
                                // Non-zero placeholder; the stored average
                                // drives the ratio below
                                1.0
                            }
                            None => {
                                return Err(Error::query(format!(
                                    "unable to get latest value from status for failover: {err}"
                                )))
                            }
                        }
                    }
                }
            }
        };

        let mut desired_replicas = ctx.current_replicas;
        if value == 0.0 && average_value.is_none() {
            desired_replicas = 0;
        } else {
            let average =
                average_value.unwrap_or(value / f64::from(ctx.current_replicas));
            average_value = Some(average);
            let scale_ratio = average / settings.threshold;
            if (1.0 - scale_ratio).abs() >= self.config.toleration {
                desired_replicas =
                    (scale_ratio * f64::from(ctx.current_replicas)).ceil() as i32;
            }
        }

        if should_update_average {
            let average_milli = (average_value.unwrap_or(0.0) * 1000.0).round() as i64;
            ctx.status.set_target_status(TargetStatus {
                target: target_status_name.clone(),
                scaler: self.plugin_name.to_string(),
                desired_replicas,
                metric: MetricTarget {
                    type_: MetricTargetType::AverageValue,
                    average_value: Some(format!("{average_milli}m")),
                    ..Default::default()
                },
            });
        }
        Ok(ScalerOutput {
            desired_replicas,
            managed_target_status: vec![target_status_name],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReplicaAutoscalerStatus;
    use crate::metrics::MockMetricsClient;
    use crate::pods::{MockPodLister, Selector};
    use serde_json::json;

    fn config() -> PrometheusConfig {
        PrometheusConfig {
            toleration: 0.05,
            default_timeout_seconds: 30,
            default_server: Server {
                server_address: Some("http://prometheus:9090".into()),
                ..Default::default()
            },
        }
    }

    fn settings_json(threshold: f64) -> serde_json::Value {
        json!({
            "query": "sum(rate(http_requests_total[1m]))",
            "threshold": threshold,
        })
    }

    fn query_ok(value: f64) -> Box<MockQueryClient> {
        let mut client = MockQueryClient::new();
        client
            .expect_query()
            .returning(move |_, _, _| Ok(value));
        Box::new(client)
    }

    fn query_failing() -> Box<MockQueryClient> {
        let mut client = MockQueryClient::new();
        client
            .expect_query()
            .returning(|_, _, _| Err(Error::query("prometheus unreachable")));
        Box::new(client)
    }

    async fn run_scaler(
        query_client: Box<dyn QueryClient>,
        raw_settings: serde_json::Value,
        current_replicas: i32,
        status: &mut ReplicaAutoscalerStatus,
    ) -> Result<ScalerOutput, Error> {
        let scaler = PrometheusScaler::with_query_client("prometheus", config(), query_client);
        let selector = Selector::parse("app=web").unwrap();
        let pod_lister = MockPodLister::new();
        let metrics = MockMetricsClient::new();
        scaler
            .get(ScalerContext {
                current_replicas,
                raw_settings,
                namespace: "default",
                selector: &selector,
                status,
                pod_lister: &pod_lister,
                metrics: &metrics,
            })
            .await
    }

    #[tokio::test]
    async fn parked_workloads_stay_parked() {
        let mut status = ReplicaAutoscalerStatus::default();
        let output = run_scaler(query_ok(100.0), settings_json(10.0), 0, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 0);
        assert!(output.managed_target_status.is_empty());
    }

    #[tokio::test]
    async fn zero_metric_scales_to_zero() {
        let mut status = ReplicaAutoscalerStatus::default();
        let output = run_scaler(query_ok(0.0), settings_json(10.0), 3, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 0);
    }

    /// Story: 90 requests/s across 3 replicas is 30 per replica against a
    /// threshold of 10, so the workload should triple.
    #[tokio::test]
    async fn ratio_above_threshold_scales_up() {
        let mut status = ReplicaAutoscalerStatus::default();
        let output = run_scaler(query_ok(90.0), settings_json(10.0), 3, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 9);

        // The average value lands in status for failover
        let record = status.target_status(&output.managed_target_status[0]).unwrap();
        assert_eq!(record.metric.average_value.as_deref(), Some("30000m"));
        assert_eq!(record.scaler, "prometheus");
    }

    #[tokio::test]
    async fn ratio_within_toleration_holds() {
        let mut status = ReplicaAutoscalerStatus::default();
        // 30.6 over 3 replicas = 10.2 per replica: ratio 1.02
        let output = run_scaler(query_ok(30.6), settings_json(10.0), 3, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 3);
    }

    #[tokio::test]
    async fn fail_as_error_aborts() {
        let mut status = ReplicaAutoscalerStatus::default();
        let result = run_scaler(query_failing(), settings_json(10.0), 3, &mut status).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fail_as_zero_scales_to_zero_without_touching_status() {
        let mut status = ReplicaAutoscalerStatus::default();
        let mut settings = settings_json(10.0);
        settings["failureMode"] = json!("FailAsZero");
        let output = run_scaler(query_failing(), settings, 3, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 0);
        assert!(status.targets.is_empty());
    }

    #[tokio::test]
    async fn fail_as_last_value_reuses_the_stored_average() {
        let mut settings = settings_json(10.0);
        settings["failureMode"] = json!("FailAsLastValue");

        // Seed the stored average through a successful cycle
        let mut status = ReplicaAutoscalerStatus::default();
        run_scaler(query_ok(90.0), settings.clone(), 3, &mut status)
            .await
            .unwrap();

        // The endpoint dies; the stored 30/replica average still applies
        let output = run_scaler(query_failing(), settings, 3, &mut status)
            .await
            .unwrap();
        assert_eq!(output.desired_replicas, 9);
    }

    #[tokio::test]
    async fn fail_as_last_value_without_history_aborts() {
        let mut status = ReplicaAutoscalerStatus::default();
        let mut settings = settings_json(10.0);
        settings["failureMode"] = json!("FailAsLastValue");
        let result = run_scaler(query_failing(), settings, 3, &mut status).await;
        assert!(result.is_err());
    }

    #[test]
    fn status_name_is_stable_and_query_sensitive() {
        let scaler =
            PrometheusScaler::with_query_client("prometheus", config(), Box::new(MockQueryClient::new()));
        let a = scaler.target_status_name("up");
        let b = scaler.target_status_name("up");
        let c = scaler.target_status_name("rate(up[1m])");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("prometheus/"));
    }

    #[test]
    fn settings_validation() {
        let settings: Settings = serde_json::from_value(settings_json(10.0)).unwrap();
        assert!(settings.validate().is_ok());

        let empty_query: Settings =
            serde_json::from_value(json!({"query": "", "threshold": 1.0})).unwrap();
        assert!(empty_query.validate().is_err());

        let bad_threshold: Settings =
            serde_json::from_value(json!({"query": "up", "threshold": 0.0})).unwrap();
        assert!(bad_threshold.validate().is_err());
    }

    #[test]
    fn vector_response_parsing() {
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {}, "value": [1_435_781_451.781, "42.5"]},
                ],
            },
        });
        let vector: VectorResponse = serde_json::from_value(body).unwrap();
        assert_eq!(vector.status, "success");
        assert_eq!(vector.data.result.len(), 1);
        assert_eq!(vector.data.result[0].value.1, "42.5");
    }
}
