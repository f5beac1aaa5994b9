use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;

use super::aggregate::aggregate;
use super::batch::{AggregatedRow, Partition, RowSet, COLUMNS};
use super::buffer::RecordBuffer;
use super::schema::adapt_row_set;
use super::warehouse::Warehouse;

/// How often [`FlushCoordinator::flush`] re-checks a held guard.
const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What asked for a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// Buffer occupancy reached the capacity threshold.
    Capacity,
    /// The flush interval elapsed since the last successful flush.
    Interval,
    /// Final flush on process shutdown.
    Shutdown,
}

impl FlushTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Destination table per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub counts: String,
    pub last: String,
    pub timers: String,
}

impl TableNames {
    pub fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self {
            counts: cfg.counts_table.clone(),
            last: cfg.last_table.clone(),
            timers: cfg.timers_table.clone(),
        }
    }

    pub fn get(&self, partition: Partition) -> &str {
        match partition {
            Partition::Counts => &self.counts,
            Partition::Last => &self.last,
            Partition::Timers => &self.timers,
        }
    }
}

/// Rows shipped to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableWrite {
    pub partition: Partition,
    pub table: String,
    pub rows: usize,
}

/// Summary of a flush that drained at least one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    /// Records taken from the buffer.
    pub drained: usize,
    /// Successful table writes, in partition order.
    pub written: Vec<TableWrite>,
    /// Columns shipped uncast because a value failed to convert.
    pub cast_failures: usize,
    pub duration: Duration,
}

/// A table write that failed during a flush.
#[derive(Debug)]
pub struct TableError {
    pub table: String,
    pub error: anyhow::Error,
}

/// Flush whose drained records were partially or entirely lost.
#[derive(Debug)]
pub struct FlushFailure {
    pub report: FlushReport,
    pub errors: Vec<TableError>,
}

impl std::fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} table writes failed",
            self.errors.len(),
            self.errors.len() + self.report.written.len()
        )?;
        for e in &self.errors {
            write!(f, "; {}: {:#}", e.table, e.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FlushFailure {}

#[derive(Debug)]
pub enum FlushOutcome {
    /// Another flush held the guard.
    Skipped,
    /// The buffer had nothing to drain.
    Empty,
    Flushed(FlushReport),
    Failed(FlushFailure),
}

impl FlushOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Empty => "empty",
            Self::Flushed(_) => "flushed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Releases the in-progress flag when dropped.
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the single flush path shared by both watchers and shutdown.
///
/// At most one flush runs at a time; a trigger that loses the
/// compare-and-set returns [`FlushOutcome::Skipped`] without waiting.
pub struct FlushCoordinator<W: Warehouse> {
    buffer: Arc<RecordBuffer>,
    warehouse: W,
    tables: TableNames,
    max_batch: usize,
    in_progress: AtomicBool,
    last_flush: parking_lot::Mutex<Instant>,
    health: Option<Arc<HealthMetrics>>,
}

impl<W: Warehouse> FlushCoordinator<W> {
    pub fn new(
        buffer: Arc<RecordBuffer>,
        warehouse: W,
        tables: TableNames,
        max_batch: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            buffer,
            warehouse,
            tables,
            max_batch: max_batch.max(1),
            in_progress: AtomicBool::new(false),
            last_flush: parking_lot::Mutex::new(Instant::now()),
            health,
        }
    }

    pub fn buffer(&self) -> &Arc<RecordBuffer> {
        &self.buffer
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    /// Time since the last successful flush (or since construction).
    pub fn since_last_flush(&self) -> Duration {
        self.last_flush.lock().elapsed()
    }

    pub fn is_flushing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Checks every destination table resolves to a non-empty schema.
    pub async fn verify_destinations(&self) -> Result<()> {
        for partition in Partition::all() {
            let table = self.tables.get(*partition);
            let types = self
                .warehouse
                .resolve_column_types(table, &COLUMNS)
                .await
                .with_context(|| format!("resolving schema of {table}"))?;

            if types.is_empty() {
                bail!("table {table} has none of the expected columns");
            }

            debug!(table, columns = types.len(), "destination schema resolved");
        }

        Ok(())
    }

    fn try_acquire(&self) -> Option<FlushGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard {
                flag: &self.in_progress,
            })
    }

    /// Runs a flush unless one is already in progress.
    pub async fn try_flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let Some(_guard) = self.try_acquire() else {
            debug!(trigger = trigger.as_str(), "flush already in progress, skipping");
            self.record_outcome(trigger, &FlushOutcome::Skipped);
            return FlushOutcome::Skipped;
        };

        self.run(trigger).await
    }

    /// Runs a flush, waiting for any in-flight flush to finish first.
    pub async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let _guard = loop {
            if let Some(guard) = self.try_acquire() {
                break guard;
            }
            tokio::time::sleep(GUARD_POLL_INTERVAL).await;
        };

        self.run(trigger).await
    }

    async fn run(&self, trigger: FlushTrigger) -> FlushOutcome {
        let started = std::time::Instant::now();
        let records = self.buffer.drain_up_to(self.max_batch);
        self.update_occupancy();

        if records.is_empty() {
            self.record_outcome(trigger, &FlushOutcome::Empty);
            return FlushOutcome::Empty;
        }

        let drained = records.len();
        let batch = aggregate(records);

        let mut written = Vec::with_capacity(Partition::all().len());
        let mut errors = Vec::new();
        let mut cast_failures = 0;

        for partition in Partition::all() {
            let rows = batch.rows(*partition);
            if rows.is_empty() {
                continue;
            }

            let table = self.tables.get(*partition);
            match self.ship(table, rows).await {
                Ok((n, failed)) => {
                    cast_failures += failed;
                    written.push(TableWrite {
                        partition: *partition,
                        table: table.to_string(),
                        rows: n,
                    });
                }
                Err(e) => {
                    error!(
                        table,
                        rows = rows.len(),
                        error = %format!("{e:#}"),
                        "writing batch failed, rows dropped"
                    );
                    if let Some(health) = &self.health {
                        health.write_errors.with_label_values(&[table]).inc();
                    }
                    errors.push(TableError {
                        table: table.to_string(),
                        error: e,
                    });
                }
            }
        }

        let report = FlushReport {
            trigger,
            drained,
            written,
            cast_failures,
            duration: started.elapsed(),
        };

        let outcome = if errors.is_empty() {
            *self.last_flush.lock() = Instant::now();
            info!(
                trigger = trigger.as_str(),
                records = drained,
                counts = batch.counts.len(),
                last = batch.last.len(),
                timers = batch.timers.len(),
                duration_ms = report.duration.as_millis() as u64,
                "flushed buffer",
            );
            FlushOutcome::Flushed(report)
        } else {
            FlushOutcome::Failed(FlushFailure { report, errors })
        };

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&[trigger.as_str()])
                .observe(started.elapsed().as_secs_f64());
            health.flush_batch_size.observe(drained as f64);
        }
        self.record_outcome(trigger, &outcome);

        outcome
    }

    /// Resolves, adapts and writes one partition. Returns the row count
    /// and the number of columns left uncast.
    async fn ship(&self, table: &str, rows: &[AggregatedRow]) -> Result<(usize, usize)> {
        let mut row_set = RowSet::from_rows(rows);
        let columns: Vec<String> = row_set
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

        let types = self
            .warehouse
            .resolve_column_types(table, &column_refs)
            .await
            .with_context(|| format!("resolving schema of {table}"))?;

        let report = adapt_row_set(&mut row_set, &types);

        for failure in &report.failed {
            error!(
                table,
                column = %failure.column,
                target = %failure.target,
                error = %failure.error,
                "casting column failed, shipping uncast",
            );
            if let Some(health) = &self.health {
                health
                    .cast_failures
                    .with_label_values(&[table, &failure.column])
                    .inc();
            }
        }
        for column in &report.missing {
            warn!(table, column = %column, "column not in destination schema, shipping uncast");
        }

        self.warehouse
            .write_batch(table, &row_set)
            .await
            .with_context(|| format!("writing {} rows to {table}", row_set.len()))?;

        if let Some(health) = &self.health {
            health
                .rows_written
                .with_label_values(&[table])
                .inc_by(row_set.len() as f64);
        }

        Ok((row_set.len(), report.failed.len()))
    }

    fn update_occupancy(&self) {
        if let Some(health) = &self.health {
            health.buffer_occupancy.set(self.buffer.len() as f64);
        }
    }

    fn record_outcome(&self, trigger: FlushTrigger, outcome: &FlushOutcome) {
        if let Some(health) = &self.health {
            health
                .flushes
                .with_label_values(&[trigger.as_str(), outcome.as_str()])
                .inc();
        }
    }
}
