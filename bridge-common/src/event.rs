use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Severity vocabulary of the monitoring source.
///
/// Parsing is case-insensitive and never fails: values outside the known vocabulary are kept
/// verbatim in `Other` so they survive a round trip through the dead letter store.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum IntakeSeverity {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
    Other(String),
}

impl FromStr for IntakeSeverity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_ref() {
            "critical" => IntakeSeverity::Critical,
            "error" => IntakeSeverity::Error,
            "warning" => IntakeSeverity::Warning,
            "information" | "informational" => IntakeSeverity::Information,
            "verbose" => IntakeSeverity::Verbose,
            _ => IntakeSeverity::Other(s.trim().to_owned()),
        })
    }
}

impl fmt::Display for IntakeSeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IntakeSeverity::Critical => write!(f, "Critical"),
            IntakeSeverity::Error => write!(f, "Error"),
            IntakeSeverity::Warning => write!(f, "Warning"),
            IntakeSeverity::Information => write!(f, "Information"),
            IntakeSeverity::Verbose => write!(f, "Verbose"),
            IntakeSeverity::Other(value) => write!(f, "{value}"),
        }
    }
}

impl Default for IntakeSeverity {
    fn default() -> Self {
        IntakeSeverity::Warning
    }
}

struct IntakeSeverityVisitor;

impl<'de> Visitor<'de> for IntakeSeverityVisitor {
    type Value = IntakeSeverity;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of IntakeSeverity")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match IntakeSeverity::from_str(s) {
            Ok(severity) => Ok(severity),
            Err(never) => match never {},
        }
    }
}

impl<'de> Deserialize<'de> for IntakeSeverity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(IntakeSeverityVisitor)
    }
}

impl Serialize for IntakeSeverity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A decoded record of the monitoring source feed. Immutable once decoded.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IntakeEvent {
    pub id: Uuid,
    pub name: String,
    pub severity: IntakeSeverity,
    pub description: String,
    /// Computer name, falling back to the monitoring object path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_object_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_raised: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_state: Option<String>,
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
    pub source_file: String,
    pub received_at: DateTime<Utc>,
}

/// The three-level severity accepted by the event management API.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OutboundSeverity {
    Critical,
    Warning,
    Normal,
}

impl fmt::Display for OutboundSeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutboundSeverity::Critical => write!(f, "critical"),
            OutboundSeverity::Warning => write!(f, "warning"),
            OutboundSeverity::Normal => write!(f, "normal"),
        }
    }
}

/// Payload submitted to the event management API.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub title: String,
    pub severity: OutboundSeverity,
    pub source: String,
    pub category: String,
    pub application: String,
    pub object: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_attributes: Option<Map<String, Value>>,
}

/// State of one in-flight delivery of an event. Dropped once the event is delivered or
/// dead-lettered.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub correlation_id: Uuid,
    pub event_id: Uuid,
    pub source_file: String,
    /// Number of submission calls made so far.
    pub attempt: u32,
    pub started_at: Instant,
}

impl ProcessingContext {
    pub fn new(correlation_id: Uuid, event_id: Uuid, source_file: &str) -> Self {
        Self {
            correlation_id,
            event_id,
            source_file: source_file.to_owned(),
            attempt: 0,
            started_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parsing_is_case_insensitive() {
        assert_eq!(
            "CRITICAL".parse::<IntakeSeverity>().unwrap(),
            IntakeSeverity::Critical
        );
        assert_eq!(
            "warning".parse::<IntakeSeverity>().unwrap(),
            IntakeSeverity::Warning
        );
        assert_eq!(
            "Informational".parse::<IntakeSeverity>().unwrap(),
            IntakeSeverity::Information
        );
        assert_eq!(
            "Disaster".parse::<IntakeSeverity>().unwrap(),
            IntakeSeverity::Other("Disaster".to_owned())
        );
    }

    #[test]
    fn test_unknown_severity_survives_serialization() {
        let severity = IntakeSeverity::Other("Sev1".to_owned());
        let json = serde_json::to_string(&severity).unwrap();
        assert_eq!(json, "\"Sev1\"");

        let back: IntakeSeverity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, severity);
    }

    #[test]
    fn test_outbound_event_wire_names() {
        let event = OutboundEvent {
            title: "Disk full".to_owned(),
            severity: OutboundSeverity::Critical,
            source: "SCOM".to_owned(),
            category: "Alert".to_owned(),
            application: "SCOM".to_owned(),
            object: "web-01".to_owned(),
            description: String::new(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
            custom_attributes: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["severity"], "critical");
        assert!(value.get("occurredAt").is_some());
        assert!(value.get("correlationId").is_some());
        assert!(value.get("customAttributes").is_none());
    }
}
