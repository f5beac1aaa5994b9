//! Statsd datagram parsing.
//!
//! Decodes one `dimensions:value|suffix` line into a [`TypedRecord`]. The
//! dotted dimension key is split into up to four fields; anything past the
//! fourth is folded back into `name`.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::record::{MeasureKind, MetricPoint, TypedRecord};

const TYPE_SEPARATOR: char = '|';
const VALUE_SEPARATOR: char = ':';
const FIELD_SEPARATOR: char = '.';

/// Errors that can occur while decoding a statsd record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("datagram is not valid utf-8")]
    InvalidUtf8,

    #[error("missing '|' type separator in {record:?}")]
    MissingTypeSeparator { record: String },

    #[error("unknown measure suffix {suffix:?}")]
    UnknownMeasureSuffix { suffix: String },

    #[error("missing ':' value separator in {record:?}")]
    MissingValueSeparator { record: String },

    #[error("malformed value {value:?}")]
    MalformedValue { value: String },

    #[error("unknown measure format {record:?}: expected at least app.domain")]
    UnknownMeasureFormat { record: String },
}

impl ParseError {
    /// Stable label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingTypeSeparator { .. } => "missing_type_separator",
            Self::UnknownMeasureSuffix { .. } => "unknown_measure_suffix",
            Self::MissingValueSeparator { .. } => "missing_value_separator",
            Self::MalformedValue { .. } => "malformed_value",
            Self::UnknownMeasureFormat { .. } => "unknown_measure_format",
        }
    }
}

/// Parse a raw datagram payload. The bytes must be UTF-8.
pub fn parse_datagram(data: &[u8], now: SystemTime) -> Result<TypedRecord, ParseError> {
    let line = std::str::from_utf8(data).map_err(|_| ParseError::InvalidUtf8)?;
    parse_record(line, now)
}

/// Parse a single statsd line, stamping it with `now`.
pub fn parse_record(line: &str, now: SystemTime) -> Result<TypedRecord, ParseError> {
    let record = line.trim();

    let (value_line, suffix) =
        record
            .split_once(TYPE_SEPARATOR)
            .ok_or_else(|| ParseError::MissingTypeSeparator {
                record: record.to_string(),
            })?;

    let kind =
        MeasureKind::from_suffix(suffix).ok_or_else(|| ParseError::UnknownMeasureSuffix {
            suffix: suffix.to_string(),
        })?;

    let (key, raw_value) =
        value_line
            .split_once(VALUE_SEPARATOR)
            .ok_or_else(|| ParseError::MissingValueSeparator {
                record: record.to_string(),
            })?;

    let value: f64 = raw_value
        .trim()
        .parse()
        .map_err(|_| ParseError::MalformedValue {
            value: raw_value.to_string(),
        })?;

    let point = split_dimensions(key, value, epoch_seconds(now)).ok_or_else(|| {
        ParseError::UnknownMeasureFormat {
            record: record.to_string(),
        }
    })?;

    Ok(TypedRecord::new(point, kind))
}

/// Applies the field-count policy to a dotted key. Returns `None` for
/// keys with fewer than two fields.
fn split_dimensions(key: &str, value: f64, timestamp: f64) -> Option<MetricPoint> {
    let mut fields = key.splitn(4, FIELD_SEPARATOR);

    let app = fields.next()?;
    let domain = fields.next()?;
    let check = fields.next();
    // splitn(4) leaves any further separators inside the last field.
    let name = fields.next();

    Some(MetricPoint {
        app: app.to_string(),
        domain: domain.to_string(),
        value,
        timestamp,
        check: check.map(str::to_string),
        name: name.map(str::to_string),
    })
}

fn epoch_seconds(now: SystemTime) -> f64 {
    match now.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn parse(line: &str) -> TypedRecord {
        parse_record(line, at(1_700_000_000)).expect("record should parse")
    }

    // -- Field-count policy --

    #[test]
    fn test_two_fields() {
        let rec = parse("airflow.scheduler_heartbeat:1|c");
        assert_eq!(rec.kind, MeasureKind::Count);
        assert_eq!(rec.point.app, "airflow");
        assert_eq!(rec.point.domain, "scheduler_heartbeat");
        assert_eq!(rec.point.value, 1.0);
        assert_eq!(rec.point.check, None);
        assert_eq!(rec.point.name, None);
    }

    #[test]
    fn test_three_fields_sets_check() {
        let rec = parse("airflow.executor.open_slots:32|g");
        assert_eq!(rec.kind, MeasureKind::Last);
        assert_eq!(rec.point.domain, "executor");
        assert_eq!(rec.point.check.as_deref(), Some("open_slots"));
        assert_eq!(rec.point.name, None);
        assert_eq!(rec.point.value, 32.0);
    }

    #[test]
    fn test_scheduler_critical_section_timer() {
        let rec = parse("airflow.scheduler.critical_section_duration:8.49|ms");
        assert_eq!(rec.kind, MeasureKind::Timer);
        assert_eq!(rec.point.domain, "scheduler");
        assert_eq!(rec.point.check.as_deref(), Some("critical_section_duration"));
        assert_eq!(rec.point.name, None);
        assert_eq!(rec.point.value, 8.49);
    }

    #[test]
    fn test_four_fields() {
        let rec = parse("airflow.pool.open_slots.default_pool:128|g");
        assert_eq!(rec.kind, MeasureKind::Last);
        assert_eq!(rec.point.app, "airflow");
        assert_eq!(rec.point.domain, "pool");
        assert_eq!(rec.point.check.as_deref(), Some("open_slots"));
        assert_eq!(rec.point.name.as_deref(), Some("default_pool"));
        assert_eq!(rec.point.value, 128.0);
    }

    #[test]
    fn test_more_than_four_fields_joins_rest_into_name() {
        let rec = parse("airflow.dag.my_dag.my_task.duration:412.5|ms");
        assert_eq!(rec.kind, MeasureKind::Timer);
        assert_eq!(rec.point.domain, "dag");
        assert_eq!(rec.point.check.as_deref(), Some("my_dag"));
        assert_eq!(rec.point.name.as_deref(), Some("my_task.duration"));
        assert_eq!(rec.point.value, 412.5);
    }

    #[test]
    fn test_timer_seconds_suffix() {
        let rec = parse("airflow.dagrun.duration.success.etl:3.2|s");
        assert_eq!(rec.kind, MeasureKind::Timer);
        assert_eq!(rec.point.check.as_deref(), Some("duration"));
        assert_eq!(rec.point.name.as_deref(), Some("success.etl"));
    }

    #[test]
    fn test_timestamp_comes_from_clock() {
        let rec = parse_record("airflow.x:1|c", at(42)).unwrap();
        assert_eq!(rec.point.timestamp, 42.0);

        let rec = parse_record(
            "airflow.x:1|c",
            UNIX_EPOCH + Duration::from_millis(1_500),
        )
        .unwrap();
        assert_eq!(rec.point.timestamp, 1.5);
    }

    #[test]
    fn test_trailing_newline_trimmed() {
        let rec = parse("airflow.scheduler_heartbeat:1|c\n");
        assert_eq!(rec.kind, MeasureKind::Count);
        assert_eq!(rec.point.domain, "scheduler_heartbeat");
    }

    #[test]
    fn test_negative_and_exponent_values() {
        assert_eq!(parse("a.b:-3|g").point.value, -3.0);
        assert_eq!(parse("a.b:1e3|g").point.value, 1000.0);
    }

    // -- Error cases --

    #[test]
    fn test_single_field_rejected() {
        let err = parse_record("heartbeat:1|c", at(0)).unwrap_err();
        assert!(matches!(err, ParseError::UnknownMeasureFormat { .. }));
        assert_eq!(err.kind(), "unknown_measure_format");
    }

    #[test]
    fn test_unknown_suffix_rejected() {
        let err = parse_record("airflow.x:1|h", at(0)).unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownMeasureSuffix {
                suffix: "h".to_string()
            }
        );
    }

    #[test]
    fn test_sample_rate_suffix_rejected() {
        let err = parse_record("airflow.x:1|c|@0.5", at(0)).unwrap_err();
        assert!(matches!(err, ParseError::UnknownMeasureSuffix { .. }));
    }

    #[test]
    fn test_missing_type_separator() {
        let err = parse_record("airflow.x:1", at(0)).unwrap_err();
        assert_eq!(err.kind(), "missing_type_separator");
    }

    #[test]
    fn test_missing_value_separator() {
        let err = parse_record("airflow.x|c", at(0)).unwrap_err();
        assert_eq!(err.kind(), "missing_value_separator");
    }

    #[test]
    fn test_malformed_value() {
        let err = parse_record("airflow.x:abc|c", at(0)).unwrap_err();
        assert_eq!(
            err,
            ParseError::MalformedValue {
                value: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_empty_record() {
        let err = parse_record("", at(0)).unwrap_err();
        assert_eq!(err.kind(), "missing_type_separator");
    }

    #[test]
    fn test_parse_datagram_rejects_invalid_utf8() {
        let err = parse_datagram(&[0xff, 0xfe, b'|', b'c'], at(0)).unwrap_err();
        assert_eq!(err, ParseError::InvalidUtf8);
    }

    #[test]
    fn test_parse_datagram_valid() {
        let rec = parse_datagram(b"airflow.ti_failures:1|c", at(10)).unwrap();
        assert_eq!(rec.kind, MeasureKind::Count);
        assert_eq!(rec.point.domain, "ti_failures");
        assert_eq!(rec.point.timestamp, 10.0);
    }
}
