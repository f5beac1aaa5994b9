#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use airmetrics::sink::batch::RowSet;
use airmetrics::sink::flush::TableNames;
use airmetrics::sink::schema::ColumnType;
use airmetrics::sink::warehouse::Warehouse;
use anyhow::{bail, Result};
use parking_lot::Mutex;

/// Warehouse double that records writes and the peak number of
/// concurrent writers.
pub struct MemoryWarehouse {
    pub schema: HashMap<String, ColumnType>,
    pub writes: Mutex<Vec<(String, RowSet)>>,
    pub failing: HashSet<String>,
    pub delay: Duration,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        let schema = [
            ("app", "LowCardinality(String)"),
            ("domain", "LowCardinality(String)"),
            ("check", "Nullable(String)"),
            ("name", "Nullable(String)"),
            ("value", "Float64"),
            ("timestamp", "DateTime64(3, 'UTC')"),
        ]
        .iter()
        .map(|(n, t)| (n.to_string(), ColumnType::from_type_name(t)))
        .collect();

        Self {
            schema,
            writes: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn rows_in(&self, table: &str) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, rs)| rs.len())
            .sum()
    }

    pub fn single_write(&self, table: &str) -> RowSet {
        let writes = self.writes.lock();
        let matching: Vec<&RowSet> = writes
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, rs)| rs)
            .collect();
        assert_eq!(matching.len(), 1, "expected one write to {table}");
        matching[0].clone()
    }
}

impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve_column_types(
        &self,
        _table: &str,
        columns: &[&str],
    ) -> Result<HashMap<String, ColumnType>> {
        Ok(self
            .schema
            .iter()
            .filter(|(n, _)| columns.contains(&n.as_str()))
            .map(|(n, t)| (n.clone(), t.clone()))
            .collect())
    }

    async fn write_batch(&self, table: &str, rows: &RowSet) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(table) {
            bail!("table {table} rejected insert");
        }

        self.writes.lock().push((table.to_string(), rows.clone()));
        Ok(())
    }
}

pub fn tables() -> TableNames {
    TableNames {
        counts: "counts".to_string(),
        last: "last".to_string(),
        timers: "timers".to_string(),
    }
}
