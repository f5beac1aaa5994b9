use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseConnection;
use crate::ingest::{IngestWorker, StatsdListener};
use crate::migrate::{ClickHouseMigrator, Migrator, SchemaNames};
use crate::retry::RetryPolicy;
use crate::sink::buffer::RecordBuffer;
use crate::sink::clickhouse::ClickHouseWarehouse;
use crate::sink::flush::{FlushCoordinator, FlushOutcome, FlushTrigger, TableNames};
use crate::sink::warehouse::Warehouse;
use crate::sink::watcher::{run_capacity_watcher, run_time_watcher};
use crate::statsd::stats::IngestStats;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Background tasks of a running collector, bound to one warehouse.
///
/// Every task reports through the join set. A task that returns before
/// cancellation, for any reason, is a failure of the whole pipeline.
pub struct Pipeline<W: Warehouse> {
    coordinator: Arc<FlushCoordinator<W>>,
    cancel: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
}

impl<W: Warehouse> Pipeline<W> {
    /// Spawns the ingestion worker, both flush watchers and the ingest
    /// stats reporter.
    pub fn start(
        cfg: &Config,
        listener: StatsdListener,
        coordinator: Arc<FlushCoordinator<W>>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(IngestStats::new());
        let mut tasks = JoinSet::new();

        let worker = IngestWorker::new(
            listener,
            Arc::clone(coordinator.buffer()),
            RetryPolicy::from_config(&cfg.retry),
            cfg.listener.max_datagram_size,
            Arc::clone(&stats),
            health,
        );
        let token = cancel.child_token();
        tasks.spawn(async move { ("ingestion worker", worker.run(token).await) });

        let watcher = run_capacity_watcher(
            Arc::clone(&coordinator),
            cfg.flush.capacity_poll_interval,
            cfg.flush.fail_fast,
            cancel.child_token(),
        );
        tasks.spawn(async move { ("capacity watcher", watcher.await) });

        let watcher = run_time_watcher(
            Arc::clone(&coordinator),
            cfg.flush.interval,
            cfg.flush.fail_fast,
            cancel.child_token(),
        );
        tasks.spawn(async move { ("time watcher", watcher.await) });

        let reporter = report_ingest_stats(stats, cancel.child_token());
        tasks.spawn(async move { ("stats reporter", reporter.await) });

        info!(
            capacity = coordinator.buffer().capacity(),
            bound = coordinator.buffer().bound(),
            interval = ?cfg.flush.interval,
            warehouse = coordinator.warehouse().name(),
            "pipeline started",
        );

        Self {
            coordinator,
            cancel,
            tasks,
        }
    }

    pub fn coordinator(&self) -> &Arc<FlushCoordinator<W>> {
        &self.coordinator
    }

    /// Resolves once the first task exits, always with an error.
    ///
    /// Never resolves while every task is healthy, so it is meant to be
    /// raced against a shutdown signal.
    pub async fn wait(&mut self) -> Result<()> {
        match self.tasks.join_next().await {
            Some(Ok((name, Ok(())))) => Err(anyhow!("{name} exited unexpectedly")),
            Some(Ok((name, Err(e)))) => Err(e.context(format!("{name} failed"))),
            Some(Err(e)) => Err(anyhow::Error::new(e).context("pipeline task panicked")),
            None => std::future::pending().await,
        }
    }

    /// Stops every task, then runs the single shutdown flush.
    ///
    /// Records left behind by a flush capped at `max_batch`, or by a
    /// failed flush, are discarded and logged.
    pub async fn shutdown(mut self) -> FlushOutcome {
        self.cancel.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(task = name, "task stopped"),
                Ok((name, Err(e))) => error!(task = name, error = %format!("{e:#}"), "task failed"),
                Err(e) => error!(error = %e, "task panicked"),
            }
        }

        let outcome = self.coordinator.flush(FlushTrigger::Shutdown).await;
        match &outcome {
            FlushOutcome::Flushed(report) => info!(
                records = report.drained,
                tables = report.written.len(),
                "shutdown flush complete",
            ),
            FlushOutcome::Failed(failure) => error!(
                records = failure.report.drained,
                error = %failure,
                "shutdown flush failed, records discarded",
            ),
            FlushOutcome::Empty | FlushOutcome::Skipped => debug!("nothing to flush at shutdown"),
        }

        let leftover = self.coordinator.buffer().drain_up_to(usize::MAX);
        if !leftover.is_empty() {
            warn!(records = leftover.len(), "discarding records left after shutdown flush");
        }

        outcome
    }
}

/// Logs accepted records per kind every minute.
async fn report_ingest_stats(stats: Arc<IngestStats>, cancel: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                if total == 0 {
                    continue;
                }

                info!(received = total, "ingest stats (60s)");

                for (kind, count) in &snapshot {
                    debug!(kind = %kind, count, "  by kind (60s)");
                }
            }
        }
    }
}

/// Collector wires configuration, the ClickHouse warehouse, health metrics
/// and the pipeline together.
pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    connection: ClickHouseConnection,
    pipeline: Option<Pipeline<ClickHouseWarehouse>>,
    listen_addr: Option<SocketAddr>,
}

impl Collector {
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let connection = ClickHouseConnection::new(cfg.clickhouse.clone(), Some(Arc::clone(&health)));

        Ok(Self {
            cfg,
            health,
            connection,
            pipeline: None,
            listen_addr: None,
        })
    }

    /// Starts all components. Any error here is fatal for the process.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Warehouse connection.
        self.connection
            .start()
            .await
            .context("connecting to ClickHouse")?;
        let pool = self
            .connection
            .pool()
            .context("ClickHouse pool missing after start")?;

        // 2. Migrations, if enabled.
        if self.cfg.clickhouse.migrations.enabled {
            info!("running ClickHouse migrations...");
            ClickHouseMigrator::new(pool.clone(), SchemaNames::from_config(&self.cfg.clickhouse))
                .up()
                .await
                .context("running migrations")?;
        }

        // 3. Flush coordinator; every destination must resolve before ingesting.
        let warehouse = ClickHouseWarehouse::new(
            pool,
            self.cfg.clickhouse.database.clone(),
            Some(Arc::clone(&self.health)),
        );
        let buffer = Arc::new(RecordBuffer::new(
            self.cfg.buffer.capacity,
            self.cfg.buffer.slack,
        ));
        self.health
            .buffer_capacity
            .set(self.cfg.buffer.capacity as f64);

        let coordinator = Arc::new(FlushCoordinator::new(
            buffer,
            warehouse,
            TableNames::from_config(&self.cfg.clickhouse),
            self.cfg.max_batch(),
            Some(Arc::clone(&self.health)),
        ));
        coordinator
            .verify_destinations()
            .await
            .context("verifying destination tables")?;

        // 4. Socket and background tasks.
        let listener = StatsdListener::bind(&self.cfg.listener).await?;
        self.listen_addr = Some(listener.local_addr());

        self.pipeline = Some(Pipeline::start(
            &self.cfg,
            listener,
            coordinator,
            Some(Arc::clone(&self.health)),
        ));

        info!("collector fully started");

        Ok(())
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Resolves with an error once any background task dies.
    pub async fn wait(&mut self) -> Result<()> {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.wait().await,
            None => Err(anyhow!("collector not started")),
        }
    }

    /// Stops the pipeline, runs the final flush and releases resources.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }

        if let Err(e) = self.connection.stop().await {
            error!(error = %e, "error stopping ClickHouse connection");
        }

        self.health.stop().await?;

        Ok(())
    }
}
