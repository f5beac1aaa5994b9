use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

use super::dimension::DimensionKey;

/// Column order shared by all three destination tables.
pub const COLUMNS: [&str; 6] = ["app", "domain", "check", "name", "value", "timestamp"];

/// Destination partition of an aggregated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Counts,
    Last,
    Timers,
}

impl Partition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counts => "counts",
            Self::Last => "last",
            Self::Timers => "timers",
        }
    }

    pub fn all() -> &'static [Partition] {
        &[Self::Counts, Self::Last, Self::Timers]
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row: dimension fields plus the reduced value.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub app: String,
    pub domain: String,
    pub check: Option<String>,
    pub name: Option<String>,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl AggregatedRow {
    pub fn new(key: DimensionKey, value: f64, timestamp: f64) -> Self {
        Self {
            app: key.app,
            domain: key.domain,
            check: key.check,
            name: key.name,
            value,
            timestamp,
        }
    }
}

/// Result of aggregating one drained batch, split by destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedBatch {
    pub counts: Vec<AggregatedRow>,
    pub last: Vec<AggregatedRow>,
    pub timers: Vec<AggregatedRow>,
}

impl AggregatedBatch {
    pub fn rows(&self, partition: Partition) -> &[AggregatedRow] {
        match partition {
            Partition::Counts => &self.counts,
            Partition::Last => &self.last,
            Partition::Timers => &self.timers,
        }
    }

    pub fn total_rows(&self) -> usize {
        self.counts.len() + self.last.len() + self.timers.len()
    }
}

/// A single cell of a [`RowSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Self::Null, Self::Str)
    }
}

/// A named column of cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// Column-oriented table handed to a warehouse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<Column>,
}

impl RowSet {
    /// Builds the untyped row set for a partition: text dimensions,
    /// float value, epoch-seconds float timestamp.
    pub fn from_rows(rows: &[AggregatedRow]) -> Self {
        let mut app = Vec::with_capacity(rows.len());
        let mut domain = Vec::with_capacity(rows.len());
        let mut check = Vec::with_capacity(rows.len());
        let mut name = Vec::with_capacity(rows.len());
        let mut value = Vec::with_capacity(rows.len());
        let mut timestamp = Vec::with_capacity(rows.len());

        for row in rows {
            app.push(Value::Str(row.app.clone()));
            domain.push(Value::Str(row.domain.clone()));
            check.push(Value::from(row.check.clone()));
            name.push(Value::from(row.name.clone()));
            value.push(Value::Float(row.value));
            timestamp.push(Value::Float(row.timestamp));
        }

        let columns = COLUMNS
            .iter()
            .zip([app, domain, check, name, value, timestamp])
            .map(|(name, values)| Column {
                name: (*name).to_string(),
                values,
            })
            .collect();

        Self { columns }
    }

    pub fn from_columns(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Number of rows (length of the first column).
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(check: Option<&str>) -> AggregatedRow {
        AggregatedRow {
            app: "airflow".to_string(),
            domain: "executor".to_string(),
            check: check.map(str::to_string),
            name: None,
            value: 3.0,
            timestamp: 10.5,
        }
    }

    #[test]
    fn test_row_set_from_rows() {
        let rs = RowSet::from_rows(&[row(Some("open_slots")), row(None)]);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.column_names(), COLUMNS.to_vec());

        let check = rs.column("check").unwrap();
        assert_eq!(check.values[0], Value::Str("open_slots".to_string()));
        assert_eq!(check.values[1], Value::Null);

        let name = rs.column("name").unwrap();
        assert!(name.values.iter().all(Value::is_null));

        let ts = rs.column("timestamp").unwrap();
        assert_eq!(ts.values[0], Value::Float(10.5));
    }

    #[test]
    fn test_empty_row_set() {
        let rs = RowSet::from_rows(&[]);
        assert!(rs.is_empty());
        assert_eq!(rs.columns().len(), COLUMNS.len());
    }

    #[test]
    fn test_batch_rows_by_partition() {
        let batch = AggregatedBatch {
            counts: vec![row(None)],
            last: vec![],
            timers: vec![row(None), row(None)],
        };
        assert_eq!(batch.rows(Partition::Counts).len(), 1);
        assert!(batch.rows(Partition::Last).is_empty());
        assert_eq!(batch.rows(Partition::Timers).len(), 2);
        assert_eq!(batch.total_rows(), 3);
    }
}
