use std::collections::HashMap;

use crate::statsd::{MeasureKind, MetricPoint, TypedRecord};

use super::batch::{AggregatedBatch, AggregatedRow};
use super::dimension::DimensionKey;

/// Timer domains retained unconditionally.
const TIMER_DOMAINS: [&str; 2] = ["dag", "collect_db_dags"];
/// Domain whose timers are retained only for terminal run states.
const TIMER_DAGRUN_DOMAIN: &str = "dagrun";
const TIMER_DAGRUN_PREFIXES: [&str; 2] = ["success", "failed"];

/// Running sum for one dimension key.
#[derive(Debug, Clone, Copy, Default)]
struct CountAggregate {
    sum: f64,
    last_timestamp: f64,
}

impl CountAggregate {
    fn add(&mut self, value: f64, timestamp: f64) {
        self.sum += value;
        self.last_timestamp = timestamp;
    }
}

/// Last observation for one dimension key.
#[derive(Debug, Clone, Copy, Default)]
struct LastAggregate {
    value: f64,
    timestamp: f64,
}

impl LastAggregate {
    fn set(&mut self, value: f64, timestamp: f64) {
        self.value = value;
        self.timestamp = timestamp;
    }
}

/// Keyed accumulator that remembers first-appearance order of its keys.
struct OrderedGroups<A> {
    index: HashMap<DimensionKey, usize>,
    entries: Vec<(DimensionKey, A)>,
}

impl<A: Default> OrderedGroups<A> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, point: &MetricPoint) -> &mut A {
        let key = DimensionKey::of(point);
        let slot = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.entries.len();
                self.index.insert(key.clone(), i);
                self.entries.push((key, A::default()));
                i
            }
        };
        &mut self.entries[slot].1
    }

    fn into_rows(self, f: impl Fn(A) -> (f64, f64)) -> Vec<AggregatedRow> {
        self.entries
            .into_iter()
            .map(|(key, agg)| {
                let (value, timestamp) = f(agg);
                AggregatedRow::new(key, value, timestamp)
            })
            .collect()
    }
}

/// Reduces a drained batch into per-destination rows.
///
/// Counts sum per key, last keeps the latest arrival per key, timers pass
/// through the domain filter one row per record. Input order is arrival
/// order.
pub fn aggregate(records: Vec<TypedRecord>) -> AggregatedBatch {
    let mut counts: OrderedGroups<CountAggregate> = OrderedGroups::new();
    let mut last: OrderedGroups<LastAggregate> = OrderedGroups::new();
    let mut timers = Vec::new();

    for TypedRecord { point, kind } in records {
        match kind {
            MeasureKind::Count => counts.entry(&point).add(point.value, point.timestamp),
            MeasureKind::Last => last.entry(&point).set(point.value, point.timestamp),
            MeasureKind::Timer => {
                if keep_timer(&point) {
                    let value = point.value;
                    let timestamp = point.timestamp;
                    timers.push(AggregatedRow::new(
                        DimensionKey {
                            app: point.app,
                            domain: point.domain,
                            check: point.check,
                            name: point.name,
                        },
                        value,
                        timestamp,
                    ));
                }
            }
        }
    }

    AggregatedBatch {
        counts: counts.into_rows(|a| (a.sum, a.last_timestamp)),
        last: last.into_rows(|a| (a.value, a.timestamp)),
        timers,
    }
}

/// Timer retention rule: dag-level domains always, dag runs only when
/// the name marks a finished run.
pub fn keep_timer(point: &MetricPoint) -> bool {
    if TIMER_DOMAINS.contains(&point.domain.as_str()) {
        return true;
    }

    point.domain == TIMER_DAGRUN_DOMAIN
        && point
            .name
            .as_deref()
            .is_some_and(|n| TIMER_DAGRUN_PREFIXES.iter().any(|p| n.starts_with(p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: MeasureKind, key: &str, value: f64, timestamp: f64) -> TypedRecord {
        let mut fields = key.splitn(4, '.');
        TypedRecord::new(
            MetricPoint {
                app: fields.next().unwrap().to_string(),
                domain: fields.next().unwrap().to_string(),
                value,
                timestamp,
                check: fields.next().map(str::to_string),
                name: fields.next().map(str::to_string),
            },
            kind,
        )
    }

    #[test]
    fn test_counts_sum_per_key() {
        let batch = aggregate(vec![
            rec(MeasureKind::Count, "airflow.scheduler_heartbeat", 1.0, 1.0),
            rec(MeasureKind::Count, "airflow.ti_failures", 2.0, 2.0),
            rec(MeasureKind::Count, "airflow.scheduler_heartbeat", 1.0, 3.0),
            rec(MeasureKind::Count, "airflow.scheduler_heartbeat", 1.0, 4.0),
        ]);

        assert_eq!(batch.counts.len(), 2);
        assert_eq!(batch.counts[0].domain, "scheduler_heartbeat");
        assert_eq!(batch.counts[0].value, 3.0);
        assert_eq!(batch.counts[0].timestamp, 4.0);
        assert_eq!(batch.counts[1].domain, "ti_failures");
        assert_eq!(batch.counts[1].value, 2.0);
        assert!(batch.last.is_empty());
        assert!(batch.timers.is_empty());
    }

    #[test]
    fn test_last_takes_latest_arrival() {
        let batch = aggregate(vec![
            rec(MeasureKind::Last, "airflow.pool.open_slots.default_pool", 128.0, 5.0),
            rec(MeasureKind::Last, "airflow.executor.open_slots", 32.0, 6.0),
            rec(MeasureKind::Last, "airflow.pool.open_slots.default_pool", 120.0, 5.0),
        ]);

        assert_eq!(batch.last.len(), 2);
        assert_eq!(batch.last[0].name.as_deref(), Some("default_pool"));
        assert_eq!(batch.last[0].value, 120.0);
        assert_eq!(batch.last[1].value, 32.0);
    }

    #[test]
    fn test_absent_fields_group_together() {
        let batch = aggregate(vec![
            rec(MeasureKind::Count, "airflow.executor", 1.0, 1.0),
            rec(MeasureKind::Count, "airflow.executor", 1.0, 2.0),
            rec(MeasureKind::Count, "airflow.executor.open_slots", 1.0, 3.0),
        ]);

        assert_eq!(batch.counts.len(), 2);
        assert_eq!(batch.counts[0].check, None);
        assert_eq!(batch.counts[0].value, 2.0);
        assert_eq!(batch.counts[1].check.as_deref(), Some("open_slots"));
    }

    #[test]
    fn test_timer_filter() {
        let batch = aggregate(vec![
            rec(MeasureKind::Timer, "airflow.dagrun.duration.failed_task", 1.0, 1.0),
            rec(MeasureKind::Timer, "airflow.dagrun.duration.running", 2.0, 1.0),
            rec(MeasureKind::Timer, "airflow.dag.etl.extract.duration", 3.0, 1.0),
            rec(MeasureKind::Timer, "airflow.collect_db_dags", 4.0, 1.0),
            rec(MeasureKind::Timer, "airflow.scheduler.critical_section_duration", 5.0, 1.0),
            rec(MeasureKind::Timer, "airflow.dagrun.schedule_delay", 6.0, 1.0),
            rec(MeasureKind::Timer, "airflow.dagrun.duration.success.etl", 7.0, 1.0),
        ]);

        let values: Vec<f64> = batch.timers.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 3.0, 4.0, 7.0]);
    }

    #[test]
    fn test_timers_are_not_grouped() {
        let batch = aggregate(vec![
            rec(MeasureKind::Timer, "airflow.dag.etl.extract.duration", 3.0, 1.0),
            rec(MeasureKind::Timer, "airflow.dag.etl.extract.duration", 4.0, 2.0),
        ]);
        assert_eq!(batch.timers.len(), 2);
        assert_eq!(batch.timers[1].name.as_deref(), Some("extract.duration"));
    }

    #[test]
    fn test_empty_input() {
        let batch = aggregate(Vec::new());
        assert_eq!(batch.total_rows(), 0);
    }
}
