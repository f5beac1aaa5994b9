//! Flush watchers.
//!
//! Two independent loops drive the same [`FlushCoordinator`]: one reacts to
//! buffer occupancy, the other to time since the last successful flush.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::flush::{FlushCoordinator, FlushOutcome, FlushTrigger};
use super::warehouse::Warehouse;

/// Polls buffer occupancy every `poll_interval` and flushes once it
/// reaches the capacity threshold.
pub async fn run_capacity_watcher<W: Warehouse>(
    coordinator: Arc<FlushCoordinator<W>>,
    poll_interval: Duration,
    fail_fast: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("capacity watcher stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                let buffer = coordinator.buffer();
                if buffer.len() >= buffer.capacity() {
                    let outcome = coordinator.try_flush(FlushTrigger::Capacity).await;
                    check_outcome(FlushTrigger::Capacity, outcome, fail_fast)?;
                }
            }
        }
    }
}

/// Ticks every `interval` and flushes a non-empty buffer once `interval`
/// has passed since the last successful flush.
pub async fn run_time_watcher<W: Warehouse>(
    coordinator: Arc<FlushCoordinator<W>>,
    interval: Duration,
    fail_fast: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("time watcher stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if coordinator.since_last_flush() >= interval && !coordinator.buffer().is_empty() {
                    let outcome = coordinator.try_flush(FlushTrigger::Interval).await;
                    check_outcome(FlushTrigger::Interval, outcome, fail_fast)?;
                }
            }
        }
    }
}

fn check_outcome(trigger: FlushTrigger, outcome: FlushOutcome, fail_fast: bool) -> Result<()> {
    if let FlushOutcome::Failed(failure) = outcome {
        error!(
            trigger = trigger.as_str(),
            records = failure.report.drained,
            error = %failure,
            "flush failed",
        );
        if fail_fast {
            bail!("{} flush failed: {failure}", trigger.as_str());
        }
    }

    Ok(())
}
