use bridge_common::event::{IntakeEvent, IntakeSeverity, OutboundEvent, OutboundSeverity};
use uuid::Uuid;

pub const SOURCE_NAME: &str = "SCOM";
pub const MAX_DESCRIPTION_CHARS: usize = 1000;

const DEFAULT_CATEGORY: &str = "Alert";
const DEFAULT_OBJECT: &str = "Unknown";
const ELLIPSIS: &str = "...";

pub fn map_severity(severity: &IntakeSeverity) -> OutboundSeverity {
    match severity {
        IntakeSeverity::Critical | IntakeSeverity::Error => OutboundSeverity::Critical,
        IntakeSeverity::Warning => OutboundSeverity::Warning,
        IntakeSeverity::Information | IntakeSeverity::Verbose | IntakeSeverity::Other(_) => {
            OutboundSeverity::Normal
        }
    }
}

/// Build the outbound payload for an event under a fresh correlation id.
pub fn transform(event: &IntakeEvent) -> OutboundEvent {
    transform_with_correlation(event, Uuid::new_v4())
}

/// Build the outbound payload for an event, keeping a known correlation id.
pub fn transform_with_correlation(event: &IntakeEvent, correlation_id: Uuid) -> OutboundEvent {
    let occurred_at = event
        .time_raised
        .or(event.time_added)
        .unwrap_or(event.received_at);

    OutboundEvent {
        title: event.name.clone(),
        severity: map_severity(&event.severity),
        source: SOURCE_NAME.to_owned(),
        category: event
            .category
            .clone()
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_owned()),
        application: SOURCE_NAME.to_owned(),
        object: event
            .source_object_ref
            .clone()
            .unwrap_or_else(|| DEFAULT_OBJECT.to_owned()),
        description: truncate_description(&event.description),
        occurred_at,
        received_at: event.received_at,
        correlation_id,
        custom_attributes: (!event.custom_fields.is_empty()).then(|| event.custom_fields.clone()),
    }
}

fn truncate_description(description: &str) -> String {
    if description.chars().count() <= MAX_DESCRIPTION_CHARS {
        return description.to_owned();
    }

    let mut truncated: String = description
        .chars()
        .take(MAX_DESCRIPTION_CHARS - ELLIPSIS.len())
        .collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{Map, Value};

    use super::*;

    fn event(severity: IntakeSeverity) -> IntakeEvent {
        IntakeEvent {
            id: Uuid::new_v4(),
            name: "Service stopped".to_owned(),
            severity,
            description: "W3SVC is not running".to_owned(),
            source_object_ref: None,
            category: None,
            time_raised: None,
            time_added: None,
            priority: None,
            resolution_state: None,
            custom_fields: Map::new(),
            source_file: "alerts.xml".to_owned(),
            received_at: Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(map_severity(&IntakeSeverity::Critical), OutboundSeverity::Critical);
        assert_eq!(map_severity(&IntakeSeverity::Error), OutboundSeverity::Critical);
        assert_eq!(map_severity(&IntakeSeverity::Warning), OutboundSeverity::Warning);
        assert_eq!(
            map_severity(&"Informational".parse().unwrap()),
            OutboundSeverity::Normal
        );
        assert_eq!(map_severity(&IntakeSeverity::Verbose), OutboundSeverity::Normal);
        assert_eq!(
            map_severity(&IntakeSeverity::Other("Sev1".to_owned())),
            OutboundSeverity::Normal
        );
    }

    #[test]
    fn test_defaults() {
        let outbound = transform(&event(IntakeSeverity::Critical));

        assert_eq!(outbound.title, "Service stopped");
        assert_eq!(outbound.severity, OutboundSeverity::Critical);
        assert_eq!(outbound.source, "SCOM");
        assert_eq!(outbound.application, "SCOM");
        assert_eq!(outbound.category, "Alert");
        assert_eq!(outbound.object, "Unknown");
        assert_eq!(outbound.occurred_at, outbound.received_at);
        assert!(outbound.custom_attributes.is_none());
    }

    #[test]
    fn test_occurred_at_precedence() {
        let mut intake = event(IntakeSeverity::Warning);
        let added = intake.received_at - Duration::minutes(5);
        let raised = intake.received_at - Duration::minutes(10);

        intake.time_added = Some(added);
        assert_eq!(transform(&intake).occurred_at, added);

        intake.time_raised = Some(raised);
        assert_eq!(transform(&intake).occurred_at, raised);
    }

    #[test]
    fn test_long_description_is_truncated() {
        let mut intake = event(IntakeSeverity::Warning);
        intake.description = "d".repeat(1100);

        let description = transform(&intake).description;
        assert_eq!(description.chars().count(), 1000);
        assert!(description.ends_with("..."));
    }

    #[test]
    fn test_fresh_correlation_per_call() {
        let intake = event(IntakeSeverity::Warning);
        assert_ne!(
            transform(&intake).correlation_id,
            transform(&intake).correlation_id
        );

        let known = Uuid::new_v4();
        assert_eq!(
            transform_with_correlation(&intake, known).correlation_id,
            known
        );
    }

    #[test]
    fn test_custom_fields_become_attributes() {
        let mut intake = event(IntakeSeverity::Warning);
        intake.source_object_ref = Some("web-01".to_owned());
        intake.category = Some("Availability".to_owned());
        drop(intake
            .custom_fields
            .insert("RepeatCount".to_owned(), Value::from(3)));

        let outbound = transform(&intake);
        assert_eq!(outbound.object, "web-01");
        assert_eq!(outbound.category, "Availability");
        assert_eq!(
            outbound.custom_attributes.unwrap()["RepeatCount"],
            Value::from(3)
        );
    }
}
