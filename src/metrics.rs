//! Result metrics and guardrail validation
//!
//! Every engine return path carries a [`RequestMetrics`] record. Guardrails
//! are optional (min, max, expected ± tolerance) bounds evaluated against
//! named metric values; violations become [`Anomaly`] records attached to the
//! snapshot and are never raised as errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Bounds for a single metric value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Guardrail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<f64>,

    /// Absolute tolerance around `expected`; defaults to 0 when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

impl Guardrail {
    /// Evaluate a value against this guardrail.
    pub fn check(&self, metric: &str, value: f64) -> Option<Anomaly> {
        if let Some(min) = self.min {
            if value < min {
                return Some(Anomaly::new(metric, value, format!("below minimum {}", min)));
            }
        }

        if let Some(max) = self.max {
            if value > max {
                return Some(Anomaly::new(metric, value, format!("above maximum {}", max)));
            }
        }

        if let Some(expected) = self.expected {
            let tolerance = self.tolerance.unwrap_or(0.0);
            if (value - expected).abs() > tolerance {
                return Some(Anomaly::new(
                    metric,
                    value,
                    format!("outside expected {} ± {}", expected, tolerance),
                ));
            }
        }

        None
    }
}

/// A guardrail violation observed on a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub violation: String,
}

impl Anomaly {
    fn new(metric: &str, value: f64, violation: String) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            violation,
        }
    }
}

/// Named guardrails evaluated against a metric-value map.
pub type MetricsGuardrails = HashMap<String, Guardrail>;

/// Evaluate every configured guardrail against the provided values.
///
/// Metrics without a configured guardrail and guardrails without a matching
/// value are both ignored.
pub fn evaluate_guardrails(
    guardrails: &MetricsGuardrails,
    values: &HashMap<String, f64>,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    for (metric, guardrail) in guardrails {
        if let Some(value) = values.get(metric) {
            if let Some(anomaly) = guardrail.check(metric, *value) {
                anomalies.push(anomaly);
            }
        }
    }
    anomalies.sort_by(|a, b| a.metric.cmp(&b.metric));
    anomalies
}

/// Metrics attached to every request outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetrics {
    /// Attempts actually made (not the configured budget)
    pub total_attempts: u32,

    pub successful_attempts: u32,
    pub failed_attempts: u32,

    pub total_execution_time_ms: u64,
    pub average_attempt_time_ms: f64,

    /// True when the call was served from the response cache
    pub from_cache: bool,

    /// RFC 3339 timestamps for the whole call
    pub started_at: String,
    pub finished_at: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_state: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub anomalies: Vec<Anomaly>,
}

impl RequestMetrics {
    /// Numeric view used for guardrail evaluation.
    pub fn as_values(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("total_attempts".to_string(), f64::from(self.total_attempts)),
            (
                "successful_attempts".to_string(),
                f64::from(self.successful_attempts),
            ),
            (
                "failed_attempts".to_string(),
                f64::from(self.failed_attempts),
            ),
            (
                "total_execution_time_ms".to_string(),
                self.total_execution_time_ms as f64,
            ),
            (
                "average_attempt_time_ms".to_string(),
                self.average_attempt_time_ms,
            ),
        ])
    }

    /// Attach guardrail anomalies to this snapshot.
    pub fn validate(&mut self, guardrails: &MetricsGuardrails) {
        self.anomalies = evaluate_guardrails(guardrails, &self.as_values());
    }
}

/// Metrics snapshot for a buffer instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferMetrics {
    pub total_transactions: u64,
    pub average_queue_wait_ms: f64,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub anomalies: Vec<Anomaly>,
}
