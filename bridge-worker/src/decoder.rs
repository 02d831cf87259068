//! Turns the XML text of a source file into intake events.
//!
//! Source files hold any number of sibling record elements with no shared root. Every
//! top-level element is a record; its child elements and attributes are its fields.
use std::str::FromStr;

use bridge_common::event::{IntakeEvent, IntakeSeverity};
use bridge_common::metrics::DECODED_EVENTS_TOTAL;
use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Number, Value};
use tracing::debug;
use uuid::Uuid;

use crate::datetime::normalize_timestamp;
use crate::error::DecodeError;

pub const MAX_DESCRIPTION_CHARS: usize = 1000;

const TEXT_KEY: &str = "#text";

const KNOWN_FIELDS: &[&str] = &[
    "Name",
    "Severity",
    "Description",
    "NetbiosComputerName",
    "MonitoringObjectPath",
    "Category",
    "TimeRaised",
    "TimeAdded",
    "Priority",
    "ResolutionState",
];

#[derive(Debug, Clone)]
pub struct EventDecoder {
    record_tag: Option<String>,
    max_events: usize,
}

/// An element whose end tag has not been seen yet.
struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl EventDecoder {
    pub fn new(record_tag: Option<String>, max_events: usize) -> Self {
        Self {
            record_tag,
            max_events,
        }
    }

    /// Decode every record in `text`. Malformed input fails as a whole, records without a
    /// name are skipped, and anything past the per-file cap is dropped.
    pub fn decode(&self, text: &str, source_file: &str) -> Result<Vec<IntakeEvent>, DecodeError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Frame> = Vec::new();
        let mut events = Vec::new();
        let mut dropped = 0usize;

        loop {
            let event = reader.read_event().map_err(|e| malformed(&reader, e))?;

            match event {
                Event::Start(start) => {
                    let frame = open_frame(&start).map_err(|e| malformed(&reader, e))?;
                    stack.push(frame);
                }
                Event::Empty(start) => {
                    let frame = open_frame(&start).map_err(|e| malformed(&reader, e))?;
                    self.close_frame(frame, &mut stack, &mut events, &mut dropped, source_file);
                }
                Event::End(_) => match stack.pop() {
                    Some(frame) => {
                        self.close_frame(frame, &mut stack, &mut events, &mut dropped, source_file)
                    }
                    None => {
                        return Err(DecodeError::Malformed {
                            position: position(&reader),
                            message: "unexpected end tag".to_owned(),
                        })
                    }
                },
                Event::Text(content) => {
                    let content = content.unescape().map_err(|e| malformed(&reader, e))?;
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&content);
                    }
                }
                Event::CData(content) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&String::from_utf8_lossy(&content));
                    }
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }

        if let Some(frame) = stack.pop() {
            return Err(DecodeError::Unclosed(frame.name));
        }

        if dropped > 0 {
            debug!(
                source_file,
                dropped,
                max_events = self.max_events,
                "records past the per-file cap were dropped"
            );
        }
        metrics::counter!(DECODED_EVENTS_TOTAL).increment(events.len() as u64);

        Ok(events)
    }

    fn close_frame(
        &self,
        frame: Frame,
        stack: &mut Vec<Frame>,
        events: &mut Vec<IntakeEvent>,
        dropped: &mut usize,
        source_file: &str,
    ) {
        match stack.last_mut() {
            Some(parent) => {
                let name = frame.name.clone();
                attach(&mut parent.fields, name, frame_value(frame));
            }
            None => {
                if let Some(tag) = &self.record_tag {
                    if *tag != frame.name {
                        return;
                    }
                }
                let Some(event) = record_to_event(frame, source_file) else {
                    return;
                };
                if events.len() < self.max_events {
                    events.push(event);
                } else {
                    *dropped += 1;
                }
            }
        }
    }
}

fn open_frame(start: &BytesStart) -> Result<Frame, String> {
    let mut fields = Map::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(|e| e.to_string())?;
        drop(fields.insert(key, Value::String(value.into_owned())));
    }

    Ok(Frame {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        fields,
        text: String::new(),
    })
}

/// Leaves become their text; anything with attributes or children becomes an object, with
/// its own text under `#text`. Values stay raw strings until they are typed.
fn frame_value(frame: Frame) -> Value {
    let text = frame.text.trim();
    if frame.fields.is_empty() {
        return Value::String(text.to_owned());
    }

    let mut fields = frame.fields;
    if !text.is_empty() {
        drop(fields.insert(TEXT_KEY.to_owned(), Value::String(text.to_owned())));
    }
    Value::Object(fields)
}

/// Repeated sibling elements collect into an array.
fn attach(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            drop(fields.insert(name, value));
        }
    }
}

fn record_to_event(frame: Frame, source_file: &str) -> Option<IntakeEvent> {
    let mut fields = match frame_value(frame) {
        Value::Object(fields) => fields,
        _ => return None,
    };

    let mut take_text = |key: &str| fields.remove(key).and_then(|value| field_text(&value));

    let name = take_text("Name")?;
    let severity = take_text("Severity")
        .map(|raw| match IntakeSeverity::from_str(&raw) {
            Ok(severity) => severity,
            Err(never) => match never {},
        })
        .unwrap_or_default();
    let description = take_text("Description")
        .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect())
        .unwrap_or_default();
    let computer_name = take_text("NetbiosComputerName");
    let object_path = take_text("MonitoringObjectPath");
    let category = take_text("Category");
    let time_raised = take_text("TimeRaised").and_then(|raw| normalize_timestamp(&raw));
    let time_added = take_text("TimeAdded").and_then(|raw| normalize_timestamp(&raw));
    let priority = take_text("Priority").and_then(|raw| parse_priority(&raw));
    let resolution_state = take_text("ResolutionState");

    let custom_fields = fields
        .into_iter()
        .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key, typed(value)))
        .collect();

    Some(IntakeEvent {
        id: Uuid::new_v4(),
        name,
        severity,
        description,
        source_object_ref: computer_name.or(object_path),
        category,
        time_raised,
        time_added,
        priority,
        resolution_state,
        custom_fields,
        source_file: source_file.to_owned(),
        received_at: Utc::now(),
    })
}

/// Trimmed, non-empty text of a field. Objects contribute their `#text`, arrays their first
/// entry.
fn field_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Object(fields) => return fields.get(TEXT_KEY).and_then(field_text),
        Value::Array(items) => return items.first().and_then(field_text),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Any finite number, fractional values included.
fn parse_priority(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|priority| priority.is_finite())
}

/// Convert raw strings into booleans and numbers where they read as such.
fn typed(value: Value) -> Value {
    match value {
        Value::String(raw) => typed_scalar(raw),
        Value::Array(items) => Value::Array(items.into_iter().map(typed).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, typed(value)))
                .collect(),
        ),
        other => other,
    }
}

fn typed_scalar(raw: String) -> Value {
    match raw.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    let digits = raw.strip_prefix('-').unwrap_or(&raw);
    let leading_zero = digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.");
    if leading_zero || digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_digit()) {
        return Value::String(raw);
    }

    if let Ok(integer) = raw.parse::<i64>() {
        return Value::Number(integer.into());
    }
    match raw.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) => Value::Number(number),
        None => Value::String(raw),
    }
}

fn position(reader: &Reader<&[u8]>) -> u64 {
    u64::try_from(reader.buffer_position()).unwrap_or(u64::MAX)
}

fn malformed<E: std::fmt::Display>(reader: &Reader<&[u8]>, error: E) -> DecodeError {
    DecodeError::Malformed {
        position: position(reader),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> EventDecoder {
        EventDecoder::new(None, 100)
    }

    #[test]
    fn test_single_record() {
        let events = decoder()
            .decode(
                "<a><Name>X</Name><Severity>Warning</Severity></a>",
                "alerts.xml",
            )
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "X");
        assert_eq!(events[0].severity, IntakeSeverity::Warning);
        assert_eq!(events[0].description, "");
        assert_eq!(events[0].source_file, "alerts.xml");
    }

    #[test]
    fn test_records_without_name_are_dropped() {
        let events = decoder()
            .decode(
                "<a><Name>X</Name></a><a><Severity>Error</Severity></a><a><Name>  </Name></a>",
                "alerts.xml",
            )
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "X");
    }

    #[test]
    fn test_known_fields() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <scom_event_message>
                <Name>Disk almost full</Name>
                <Severity>critical</Severity>
                <Description>C: has 2% free &amp; falling</Description>
                <MonitoringObjectPath>Microsoft.Windows.Server</MonitoringObjectPath>
                <Category>PerformanceHealth</Category>
                <TimeRaised>3/7/2024 14:05:09</TimeRaised>
                <TimeAdded>not a date</TimeAdded>
                <Priority>2</Priority>
                <ResolutionState>New</ResolutionState>
            </scom_event_message>"#;

        let events = decoder().decode(xml, "alerts.xml").unwrap();
        let event = &events[0];

        assert_eq!(event.severity, IntakeSeverity::Critical);
        assert_eq!(event.description, "C: has 2% free & falling");
        assert_eq!(
            event.source_object_ref.as_deref(),
            Some("Microsoft.Windows.Server")
        );
        assert_eq!(event.category.as_deref(), Some("PerformanceHealth"));
        assert_eq!(
            event.time_raised.map(|t| t.to_rfc3339()),
            Some("2024-03-07T14:05:09+00:00".to_owned())
        );
        assert_eq!(event.time_added, None);
        assert_eq!(event.priority, Some(2.0));
        assert_eq!(event.resolution_state.as_deref(), Some("New"));
        assert!(event.custom_fields.is_empty());
    }

    #[test]
    fn test_computer_name_wins_over_object_path() {
        let events = decoder()
            .decode(
                "<e><Name>X</Name><MonitoringObjectPath>path</MonitoringObjectPath><NetbiosComputerName>web-01</NetbiosComputerName></e>",
                "alerts.xml",
            )
            .unwrap();

        assert_eq!(events[0].source_object_ref.as_deref(), Some("web-01"));
    }

    #[test]
    fn test_custom_fields_are_typed() {
        let xml = r#"<e id="7"><Name>X</Name><Acknowledged>true</Acknowledged><RepeatCount>3</RepeatCount>
            <Ratio>0.5</Ratio><Ticket>00123</Ticket><Tag>a</Tag><Tag>b</Tag>
            <Context kind="perf">cpu</Context><Empty/></e>"#;

        let events = decoder().decode(xml, "alerts.xml").unwrap();
        let custom = &events[0].custom_fields;

        assert_eq!(custom["id"], Value::from(7));
        assert_eq!(custom["Acknowledged"], Value::Bool(true));
        assert_eq!(custom["RepeatCount"], Value::from(3));
        assert_eq!(custom["Ratio"], Value::from(0.5));
        assert_eq!(custom["Ticket"], Value::from("00123"));
        assert_eq!(custom["Tag"], serde_json::json!(["a", "b"]));
        assert_eq!(custom["Context"], serde_json::json!({"kind": "perf", "#text": "cpu"}));
        assert_eq!(custom["Empty"], Value::from(""));
    }

    #[test]
    fn test_missing_severity_defaults_to_warning() {
        let events = decoder().decode("<e><Name>X</Name></e>", "f").unwrap();
        assert_eq!(events[0].severity, IntakeSeverity::Warning);
    }

    #[test]
    fn test_unknown_severity_is_kept() {
        let events = decoder()
            .decode("<e><Name>X</Name><Severity>Fatal</Severity></e>", "f")
            .unwrap();
        assert_eq!(events[0].severity, IntakeSeverity::Other("Fatal".to_owned()));
    }

    #[test]
    fn test_description_is_truncated() {
        let long = "x".repeat(1500);
        let events = decoder()
            .decode(
                &format!("<e><Name>X</Name><Description>{long}</Description></e>"),
                "f",
            )
            .unwrap();
        assert_eq!(events[0].description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn test_cap_per_file() {
        let xml = "<e><Name>1</Name></e><e><Name>2</Name></e><e><Name>3</Name></e>";
        let events = EventDecoder::new(None, 2).decode(xml, "f").unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "1");
        assert_eq!(events[1].name, "2");
    }

    #[test]
    fn test_record_tag_filter() {
        let xml = "<header><Name>meta</Name></header><scom_event_message><Name>X</Name></scom_event_message>";
        let events = EventDecoder::new(Some("scom_event_message".to_owned()), 10)
            .decode(xml, "f")
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "X");
    }

    #[test]
    fn test_fresh_ids() {
        let events = decoder()
            .decode("<e><Name>X</Name></e><e><Name>X</Name></e>", "f")
            .unwrap();
        assert_ne!(events[0].id, events[1].id);
    }

    #[test]
    fn test_fractional_priority_is_kept() {
        let priority = |raw: &str| {
            decoder()
                .decode(&format!("<e><Name>X</Name><Priority>{raw}</Priority></e>"), "f")
                .unwrap()[0]
                .priority
        };

        assert_eq!(priority("2.5"), Some(2.5));
        assert_eq!(priority("-1"), Some(-1.0));
        assert_eq!(priority("high"), None);
        assert_eq!(priority("NaN"), None);
    }

    #[test]
    fn test_empty_input() {
        assert!(decoder().decode("", "f").unwrap().is_empty());
        assert!(decoder().decode("  \n ", "f").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(decoder().decode("<e><Name>X</Name>", "f").is_err());
        assert!(matches!(
            decoder().decode("<e><Name>X</Severity></e>", "f"),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            decoder().decode("<e><Name>X</Name></e></extra>", "f"),
            Err(DecodeError::Malformed { .. })
        ));
    }
}
