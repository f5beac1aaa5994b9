//! Statsd wire format: record model, parser and ingest counters.

pub mod parse;
pub mod record;
pub mod stats;

pub use parse::{parse_datagram, parse_record, ParseError};
pub use record::{MeasureKind, MetricPoint, TypedRecord};
