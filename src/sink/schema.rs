//! Schema-driven type adaptation.
//!
//! Row sets leave the aggregator untyped (text dimensions, float value,
//! epoch-seconds timestamp). Before a write, each column is cast to the
//! type class the destination table declares for it. The cast branches on
//! the resolved type only; column names carry no meaning here.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use super::batch::{RowSet, Value};

/// Type class of a destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Bool,
    Timestamp,
    Date,
    /// Any type name not mapped above, kept verbatim.
    Other(String),
}

impl ColumnType {
    /// Classifies a warehouse type name. Understands ClickHouse names
    /// (with `Nullable(..)` / `LowCardinality(..)` wrappers and
    /// parameters) as well as the generic SQL names used by other
    /// warehouses (`INTEGER`, `FLOAT64`, `TIMESTAMP`, ...).
    pub fn from_type_name(raw: &str) -> Self {
        let inner = unwrap_modifiers(raw.trim());
        let base = inner
            .split_once('(')
            .map_or(inner, |(b, _)| b)
            .trim()
            .to_ascii_lowercase();

        match base.as_str() {
            "int8" | "int16" | "int32" | "int64" | "int128" | "int256" | "uint8" | "uint16"
            | "uint32" | "uint64" | "uint128" | "uint256" | "integer" | "int" | "bigint"
            | "smallint" | "tinyint" => Self::Integer,
            "float32" | "float64" | "float" | "double" | "real" | "numeric" | "bignumeric"
            | "decimal" | "decimal32" | "decimal64" | "decimal128" | "decimal256" => Self::Float,
            "string" | "fixedstring" | "varchar" | "text" => Self::String,
            "bool" | "boolean" => Self::Bool,
            "datetime" | "datetime64" | "timestamp" => Self::Timestamp,
            "date" | "date32" => Self::Date,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unwrap_modifiers(mut s: &str) -> &str {
    loop {
        let stripped = ["Nullable(", "LowCardinality("]
            .iter()
            .find_map(|prefix| s.strip_prefix(prefix).and_then(|r| r.strip_suffix(')')));
        match stripped {
            Some(inner) => s = inner.trim(),
            None => return s,
        }
    }
}

/// A single value that could not be converted.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot cast {value} to {target}")]
pub struct CastError {
    pub value: String,
    pub target: String,
}

impl CastError {
    fn new(value: &Value, target: &ColumnType) -> Self {
        Self {
            value: format!("{value:?}"),
            target: target.to_string(),
        }
    }
}

/// Casts one value to the given type class.
pub fn cast_value(value: &Value, target: &ColumnType) -> Result<Value, CastError> {
    let fail = || CastError::new(value, target);

    let cast = match target {
        ColumnType::Other(_) => Some(value.clone()),
        ColumnType::Integer => to_integer(value),
        ColumnType::Float => to_float(value),
        ColumnType::String => Some(to_text(value)),
        ColumnType::Bool => to_bool(value),
        ColumnType::Timestamp => {
            to_timestamp(value).map(|t| t.map_or(Value::Null, Value::Timestamp))
        }
        ColumnType::Date => {
            to_timestamp(value).map(|t| t.map_or(Value::Null, |t| Value::Date(t.date_naive())))
        }
    };

    cast.ok_or_else(fail)
}

fn to_integer(value: &Value) -> Option<Value> {
    let v = match value {
        Value::Null => 0,
        Value::Int(i) => *i,
        Value::Float(f) => float_to_i64(*f)?,
        Value::Bool(b) => i64::from(*b),
        Value::Str(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(i) => i,
                Err(_) => float_to_i64(s.parse::<f64>().ok()?)?,
            }
        }
        Value::Timestamp(t) => t.timestamp(),
        Value::Date(_) => return None,
    };
    Some(Value::Int(v))
}

fn float_to_i64(f: f64) -> Option<i64> {
    let t = f.trunc();
    if t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
        Some(t as i64)
    } else {
        None
    }
}

fn to_float(value: &Value) -> Option<Value> {
    let v = match value {
        Value::Null => return Some(Value::Null),
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Str(s) => s.trim().parse::<f64>().ok()?,
        Value::Timestamp(t) => t.timestamp_micros() as f64 / 1e6,
        Value::Date(_) => return None,
    };
    Some(Value::Float(v))
}

fn to_text(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Str(s) => Value::Str(s.clone()),
        Value::Int(i) => Value::Str(i.to_string()),
        Value::Float(f) => Value::Str(f.to_string()),
        Value::Bool(b) => Value::Str(b.to_string()),
        Value::Timestamp(t) => Value::Str(t.to_rfc3339()),
        Value::Date(d) => Value::Str(d.format("%Y-%m-%d").to_string()),
    }
}

fn to_bool(value: &Value) -> Option<Value> {
    let v = match value {
        Value::Null => return Some(Value::Null),
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return None,
        },
        Value::Timestamp(_) | Value::Date(_) => return None,
    };
    Some(Value::Bool(v))
}

/// `Some(None)` means a null input.
fn to_timestamp(value: &Value) -> Option<Option<DateTime<Utc>>> {
    let t = match value {
        Value::Null => return Some(None),
        Value::Timestamp(t) => *t,
        Value::Date(d) => midnight(*d)?,
        Value::Int(i) => DateTime::from_timestamp(*i, 0)?,
        Value::Float(f) => epoch_float_to_datetime(*f)?,
        Value::Str(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                t.with_timezone(&Utc)
            } else if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                midnight(d)?
            } else {
                epoch_float_to_datetime(s.parse::<f64>().ok()?)?
            }
        }
        Value::Bool(_) => return None,
    };
    Some(Some(t))
}

fn midnight(d: NaiveDate) -> Option<DateTime<Utc>> {
    Some(d.and_hms_opt(0, 0, 0)?.and_utc())
}

fn epoch_float_to_datetime(f: f64) -> Option<DateTime<Utc>> {
    if !f.is_finite() {
        return None;
    }
    let secs = f.floor();
    let nanos = (((f - secs) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(float_to_i64(secs)?, nanos)
}

/// A column left uncast because at least one of its values failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CastFailure {
    pub column: String,
    pub target: ColumnType,
    pub error: CastError,
}

/// What happened while adapting one row set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptReport {
    /// Columns cast successfully.
    pub cast: Vec<String>,
    /// Columns whose cast failed; shipped with their original values.
    pub failed: Vec<CastFailure>,
    /// Columns absent from the resolved schema; shipped as is.
    pub missing: Vec<String>,
}

impl AdaptReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// Casts every column of `rows` in place to its resolved type class.
///
/// A column is replaced only when every value converts, so a bad value
/// never produces a half-cast column.
pub fn adapt_row_set(rows: &mut RowSet, types: &HashMap<String, ColumnType>) -> AdaptReport {
    let mut report = AdaptReport::default();

    for column in rows.columns_mut() {
        let Some(target) = types.get(&column.name) else {
            report.missing.push(column.name.clone());
            continue;
        };

        let cast: Result<Vec<Value>, CastError> =
            column.values.iter().map(|v| cast_value(v, target)).collect();

        match cast {
            Ok(values) => {
                column.values = values;
                report.cast.push(column.name.clone());
            }
            Err(error) => report.failed.push(CastFailure {
                column: column.name.clone(),
                target: target.clone(),
                error,
            }),
        }
    }

    report
}
