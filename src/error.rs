//! Error types for the Updraft operator

use thiserror::Error;

use crate::timerange::ScheduleError;

/// Main error type for autoscaling operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The scale target reference resolves but the object is gone
    #[error("scale target not found: {0}")]
    TargetMissing(String),

    /// The referenced object exists but exposes no scale sub-resource
    #[error("target is not scalable: {0}")]
    TargetNotScalable(String),

    /// Validation error for specs, settings or selectors
    #[error("validation error: {0}")]
    Validation(String),

    /// Schedule expression error (cron or calendar window)
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Transient scaler plugin failure (metrics call, query, pod listing)
    #[error("scaler error: {0}")]
    Scaler(String),

    /// Replicator plugin failure
    #[error("replicator error: {0}")]
    Replicator(String),

    /// Metrics backend failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// External query endpoint failure (Prometheus, broker APIs)
    #[error("query error: {0}")]
    Query(String),

    /// Controller or plugin configuration rejected at startup
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a scaler error with the given message
    pub fn scaler(msg: impl Into<String>) -> Self {
        Self::Scaler(msg.into())
    }

    /// Create a replicator error with the given message
    pub fn replicator(msg: impl Into<String>) -> Self {
        Self::Replicator(msg.into())
    }

    /// Create a metrics error with the given message
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create a query error with the given message
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the error marks the target as unusable rather than the
    /// reconcile attempt as retryable
    pub fn is_target_unusable(&self) -> bool {
        matches!(self, Self::TargetMissing(_) | Self::TargetNotScalable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: misconfigured specs surface as validation errors with the
    /// offending detail preserved for the user.
    #[test]
    fn story_validation_errors_carry_detail() {
        let err = Error::validation("maxReplicas (2) must not be less than minReplicas (5)");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("maxReplicas"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("expected Validation variant"),
        }
    }

    /// Story: a deleted Deployment and a Deployment without a scale
    /// sub-resource are different failures with different operator advice,
    /// but both mark the target unusable so the policy stops requeueing.
    #[test]
    fn story_target_failures_are_terminal_not_retryable() {
        let missing = Error::TargetMissing("apps/v1.Deployment default/api".into());
        let unscalable = Error::TargetNotScalable("apps/v1.DaemonSet default/agent".into());

        assert!(missing.is_target_unusable());
        assert!(unscalable.is_target_unusable());
        assert!(missing.to_string().contains("not found"));
        assert!(unscalable.to_string().contains("not scalable"));

        // Transient failures stay retryable
        assert!(!Error::metrics("metrics-server timeout").is_target_unusable());
        assert!(!Error::query("prometheus returned 503").is_target_unusable());
    }

    /// Story: schedule expression failures convert losslessly so the
    /// settings layer can log the exact parse problem.
    #[test]
    fn story_schedule_errors_convert() {
        let err: Error = ScheduleError::StartEndEqual.into();
        assert!(err.to_string().contains("can not be equal"));
    }

    /// Story: plugin boot failures are config errors, which the process
    /// treats as fatal.
    #[test]
    fn story_config_errors_name_the_plugin() {
        let err = Error::config("plugin `prometheus`: default server is required");
        assert!(err.to_string().contains("prometheus"));
        match err {
            Error::Config(_) => {}
            _ => panic!("expected Config variant"),
        }
    }

    /// Story: error helpers accept both &str and String.
    #[test]
    fn story_error_construction_ergonomics() {
        let queue = "orders";
        let err = Error::scaler(format!("queue `{queue}` not found"));
        assert!(err.to_string().contains("orders"));

        let err = Error::serialization("static message");
        assert!(err.to_string().contains("static message"));
    }
}
