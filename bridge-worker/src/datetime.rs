use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Timestamp layouts emitted by the monitoring source, tried in order. All are read as UTC.
const SOURCE_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.3f",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%a %b %d %H:%M:%S %Y",
];

/// Parse a raw source timestamp. Falls back to RFC 3339 and plain ISO dates, and yields
/// `None` for anything else.
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    for format in SOURCE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M") {
        return Some(parsed.and_utc());
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|parsed| parsed.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_source_formats() {
        assert_eq!(
            normalize_timestamp("3/7/2024 14:05:09"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("3/7/2024 2:05:09 PM"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("2024-03-07T14:05:09"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("2024-03-07 14:05:09"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("Thu Mar 07 14:05:09 2024"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
    }

    #[test]
    fn test_month_first_wins_when_ambiguous() {
        assert_eq!(
            normalize_timestamp("03/07/2024 14:05:09"),
            Some(utc(2024, 3, 7, 14, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("25/12/2024 08:00:00"),
            Some(utc(2024, 12, 25, 8, 0, 0))
        );
    }

    #[test]
    fn test_fractional_seconds() {
        let parsed = normalize_timestamp("2024-03-07T14:05:09.250").unwrap();
        assert_eq!(parsed.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_iso_fallbacks() {
        assert_eq!(
            normalize_timestamp("2024-03-07T14:05:09+02:00"),
            Some(utc(2024, 3, 7, 12, 5, 9))
        );
        assert_eq!(
            normalize_timestamp("2024-03-07"),
            Some(utc(2024, 3, 7, 0, 0, 0))
        );
    }

    #[test]
    fn test_unparseable_is_none() {
        assert_eq!(normalize_timestamp(""), None);
        assert_eq!(normalize_timestamp("yesterday"), None);
        assert_eq!(normalize_timestamp("13/13/2024 10:00:00"), None);
    }
}
