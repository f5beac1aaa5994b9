use crossbeam::queue::ArrayQueue;
use thiserror::Error;

use crate::statsd::TypedRecord;

/// Returned when the buffer is at its hard bound. Hands the rejected
/// record back so the caller can retry it.
#[derive(Error, Debug)]
#[error("record buffer full ({bound} records)")]
pub struct BufferFull {
    pub record: TypedRecord,
    pub bound: usize,
}

impl BufferFull {
    pub fn into_record(self) -> TypedRecord {
        self.record
    }
}

/// Bounded lock-free FIFO of parsed records shared between the ingestion
/// worker and flushes.
///
/// `capacity` is the flush threshold; the queue itself holds up to
/// `capacity + slack` records so producers keep going while a capacity
/// flush is being scheduled.
pub struct RecordBuffer {
    queue: ArrayQueue<TypedRecord>,
    capacity: usize,
}

impl RecordBuffer {
    pub fn new(capacity: usize, slack: usize) -> Self {
        let bound = capacity.saturating_add(slack).max(1);
        Self {
            queue: ArrayQueue::new(bound),
            capacity,
        }
    }

    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, record: TypedRecord) -> Result<(), BufferFull> {
        self.queue.push(record).map_err(|record| BufferFull {
            record,
            bound: self.queue.capacity(),
        })
    }

    /// Removes up to `max` records in arrival order without waiting.
    pub fn drain_up_to(&self, max: usize) -> Vec<TypedRecord> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Flush threshold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hard bound (threshold + slack).
    #[inline]
    pub fn bound(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::statsd::{MeasureKind, MetricPoint};

    fn record(value: f64) -> TypedRecord {
        TypedRecord::new(
            MetricPoint {
                app: "airflow".to_string(),
                domain: "scheduler_heartbeat".to_string(),
                value,
                timestamp: 0.0,
                check: None,
                name: None,
            },
            MeasureKind::Count,
        )
    }

    #[test]
    fn test_bound_is_capacity_plus_slack() {
        let buf = RecordBuffer::new(10, 5);
        assert_eq!(buf.capacity(), 10);
        assert_eq!(buf.bound(), 15);
    }

    #[test]
    fn test_rejects_at_bound_and_returns_record() {
        let buf = RecordBuffer::new(2, 1);
        for i in 0..3 {
            buf.try_enqueue(record(i as f64)).unwrap();
        }

        let err = buf.try_enqueue(record(99.0)).unwrap_err();
        assert_eq!(err.bound, 3);
        assert_eq!(err.into_record().point.value, 99.0);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let buf = RecordBuffer::new(10, 0);
        for i in 0..5 {
            buf.try_enqueue(record(i as f64)).unwrap();
        }

        let first = buf.drain_up_to(3);
        let values: Vec<f64> = first.iter().map(|r| r.point.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(buf.len(), 2);

        let rest = buf.drain_up_to(100);
        assert_eq!(rest.len(), 2);
        assert!(buf.is_empty());
        assert!(buf.drain_up_to(10).is_empty());
    }

    #[test]
    fn test_concurrent_producers_never_exceed_bound() {
        let buf = Arc::new(RecordBuffer::new(100, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    let mut accepted = 0usize;
                    for i in 0..100 {
                        if buf.try_enqueue(record(i as f64)).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 110);
        assert_eq!(buf.len(), 110);
    }
}
