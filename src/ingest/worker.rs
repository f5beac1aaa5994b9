use std::future::ready;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::StatsdListener;
use crate::export::health::HealthMetrics;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::sink::buffer::RecordBuffer;
use crate::statsd::stats::IngestStats;
use crate::statsd::{parse_datagram, TypedRecord};

/// The buffer rejected a record; the record itself stays with the worker.
#[derive(Debug, Error)]
#[error("buffer full at {bound} records")]
struct Backpressure {
    bound: usize,
}

/// Reads datagrams from the listener, parses them and feeds the buffer.
pub struct IngestWorker {
    listener: StatsdListener,
    buffer: Arc<RecordBuffer>,
    policy: RetryPolicy,
    max_datagram_size: usize,
    stats: Arc<IngestStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl IngestWorker {
    pub fn new(
        listener: StatsdListener,
        buffer: Arc<RecordBuffer>,
        policy: RetryPolicy,
        max_datagram_size: usize,
        stats: Arc<IngestStats>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            listener,
            buffer,
            policy,
            max_datagram_size,
            stats,
            health,
        }
    }

    /// Runs until `cancel` fires or a fatal error occurs.
    ///
    /// Returns `Ok` on cancellation. Socket errors and an exhausted retry
    /// ceiling (empty reads or a full buffer) are errors.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; self.max_datagram_size];
        let mut empty_reads = self.policy.backoff();

        info!(
            addr = %self.listener.local_addr(),
            max_datagram_size = self.max_datagram_size,
            "ingestion worker started",
        );

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ingestion worker stopped");
                    return Ok(());
                }
                read = self.listener.recv(&mut buf) => read.context("reading statsd datagram")?,
            };

            if n == 0 {
                if let Some(health) = &self.health {
                    health.empty_reads.inc();
                }

                let Some(delay) = empty_reads.next_delay() else {
                    bail!("no data after {} consecutive empty reads", empty_reads.attempts());
                };

                debug!(delay = ?delay, attempts = empty_reads.attempts(), "empty read, backing off");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("ingestion worker stopped");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            empty_reads.reset();

            if let Some(health) = &self.health {
                health.datagrams_received.inc();
            }

            let record = match parse_datagram(&buf[..n], SystemTime::now()) {
                Ok(record) => record,
                Err(e) => {
                    debug!(error = %e, kind = e.kind(), "dropping unparseable datagram");
                    if let Some(health) = &self.health {
                        health.parse_errors.with_label_values(&[e.kind()]).inc();
                    }
                    continue;
                }
            };

            let kind = record.kind;

            match self.enqueue(record, &cancel).await {
                Ok(()) => {
                    self.stats.record(kind);
                    if let Some(health) = &self.health {
                        health.buffer_occupancy.set(self.buffer.len() as f64);
                        health.records_enqueued.with_label_values(&[kind.as_str()]).inc();
                    }
                }
                Err(RetryError::Cancelled) => {
                    self.count_dropped();
                    info!(kind = kind.as_str(), "shutdown during backoff, pending record dropped");
                    return Ok(());
                }
                Err(e) => {
                    self.count_dropped();
                    return Err(anyhow::Error::new(e).context("enqueueing record"));
                }
            }
        }
    }

    /// Enqueues `record`, backing off while the buffer is full.
    async fn enqueue(
        &self,
        record: TypedRecord,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<Backpressure>> {
        let mut pending = Some(record);

        retry(
            &self.policy,
            cancel,
            |full: &Backpressure| {
                warn!(bound = full.bound, "buffer full, backing off");
                if let Some(health) = &self.health {
                    health.enqueue_retries.inc();
                }
                true
            },
            || {
                let result = match pending.take() {
                    Some(record) => self.buffer.try_enqueue(record).map_err(|full| {
                        let bound = full.bound;
                        pending = Some(full.into_record());
                        Backpressure { bound }
                    }),
                    None => Ok(()),
                };
                ready(result)
            },
        )
        .await
    }

    fn count_dropped(&self) {
        if let Some(health) = &self.health {
            health.records_dropped.inc();
        }
    }
}
