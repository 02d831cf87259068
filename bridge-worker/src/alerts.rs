//! Threshold rules over the aggregate delivery metrics.
//!
//! Rules are plain data, `{metric, operator, threshold}`, read from configuration. A rule
//! whose comparison cannot be made is skipped with a log line.
use bridge_common::metrics::ALERTS_TOTAL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    Throughput,
    SuccessRate,
    ErrorRate,
    RetryCount,
    DlqSize,
    CircuitBreakerState,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Operator {
    fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::GreaterThan => value > threshold,
            Operator::GreaterOrEqual => value >= threshold,
            Operator::LessThan => value < threshold,
            Operator::LessOrEqual => value <= threshold,
            Operator::Equal => value == threshold,
            Operator::NotEqual => value != threshold,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub name: String,
    pub metric: Metric,
    pub operator: Operator,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Aggregate values the rules are evaluated against.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub throughput: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub retry_count: f64,
    pub dlq_size: f64,
    pub circuit_breaker_state: f64,
}

impl MetricsSnapshot {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Throughput => self.throughput,
            Metric::SuccessRate => self.success_rate,
            Metric::ErrorRate => self.error_rate,
            Metric::RetryCount => self.retry_count,
            Metric::DlqSize => self.dlq_size,
            Metric::CircuitBreakerState => self.circuit_breaker_state,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub context: MetricsSnapshot,
}

/// Alerts for every rule that holds on `snapshot`.
pub fn evaluate(rules: &[AlertRule], snapshot: &MetricsSnapshot) -> Vec<Alert> {
    let now = Utc::now();
    let mut alerts = Vec::new();

    for rule in rules {
        let value = snapshot.value(rule.metric);
        if !value.is_finite() || !rule.threshold.is_finite() {
            error!(
                rule = %rule.name,
                value, "skipping alert rule with a non-finite comparison"
            );
            continue;
        }

        if rule.operator.compare(value, rule.threshold) {
            metrics::counter!(ALERTS_TOTAL, &[("rule", rule.name.clone())]).increment(1);
            warn!(
                rule = %rule.name,
                value,
                threshold = rule.threshold,
                "alert triggered: {}",
                rule.message
            );
            alerts.push(Alert {
                name: rule.name.clone(),
                severity: rule.severity,
                message: rule.message.clone(),
                triggered_at: now,
                context: *snapshot,
            });
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(metric: Metric, operator: Operator, threshold: f64) -> AlertRule {
        AlertRule {
            name: "test-rule".to_owned(),
            metric,
            operator,
            threshold,
            severity: AlertSeverity::Warning,
            message: "threshold crossed".to_owned(),
        }
    }

    #[test]
    fn test_rules_parse_from_json() {
        let rules: Vec<AlertRule> = serde_json::from_str(
            r#"[{"name":"breaker-open","metric":"circuitBreakerState","operator":"==","threshold":2,"severity":"critical","message":"Circuit open"}]"#,
        )
        .unwrap();

        assert_eq!(rules[0].metric, Metric::CircuitBreakerState);
        assert_eq!(rules[0].operator, Operator::Equal);
        assert_eq!(rules[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_matching_rules_fire() {
        let snapshot = MetricsSnapshot {
            error_rate: 12.5,
            dlq_size: 3.0,
            ..Default::default()
        };
        let rules = vec![
            rule(Metric::ErrorRate, Operator::GreaterThan, 10.0),
            rule(Metric::DlqSize, Operator::GreaterOrEqual, 5.0),
            rule(Metric::DlqSize, Operator::NotEqual, 0.0),
        ];

        let alerts = evaluate(&rules, &snapshot);

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].context.error_rate, 12.5);
    }

    #[test]
    fn test_non_finite_values_are_skipped() {
        let snapshot = MetricsSnapshot {
            success_rate: f64::NAN,
            ..Default::default()
        };
        let rules = vec![
            rule(Metric::SuccessRate, Operator::LessThan, 50.0),
            rule(Metric::Throughput, Operator::LessOrEqual, f64::INFINITY),
            rule(Metric::Throughput, Operator::LessOrEqual, 0.0),
        ];

        let alerts = evaluate(&rules, &snapshot);
        assert_eq!(alerts.len(), 1);
    }
}
