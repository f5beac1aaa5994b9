use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "airmetrics";

/// Prometheus metrics for collector health and observability.
///
/// All metrics use the "airmetrics" namespace. Grouped by pipeline stage:
/// ingestion, buffer, flush, warehouse.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Total non-empty datagrams read from the socket.
    pub datagrams_received: Counter,
    /// Total zero-length reads.
    pub empty_reads: Counter,
    /// Parse failures by error_type.
    pub parse_errors: CounterVec,
    /// Records accepted into the buffer by kind.
    pub records_enqueued: CounterVec,
    /// Enqueue attempts rejected because the buffer was full.
    pub enqueue_retries: Counter,
    /// Records dropped at shutdown or on retry exhaustion.
    pub records_dropped: Counter,

    // === Buffer ===
    /// Current number of buffered records.
    pub buffer_occupancy: Gauge,
    /// Configured flush threshold.
    pub buffer_capacity: Gauge,

    // === Flush ===
    /// Flush attempts by trigger and outcome.
    pub flushes: CounterVec,
    /// Flush duration by trigger (1ms-30s buckets).
    pub flush_duration: HistogramVec,
    /// Records drained per flush.
    pub flush_batch_size: Histogram,

    // === Warehouse ===
    /// ClickHouse connection state (1=connected, 0=disconnected).
    pub clickhouse_connected: Gauge,
    /// Rows written by table.
    pub rows_written: CounterVec,
    /// Failed table writes by table.
    pub write_errors: CounterVec,
    /// Columns shipped uncast by table and column.
    pub cast_failures: CounterVec,
    /// ClickHouse insert duration by table (1ms-5s buckets).
    pub clickhouse_batch_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let datagrams_received = Counter::with_opts(
            Opts::new(
                "datagrams_received_total",
                "Total non-empty datagrams read from the statsd socket.",
            )
            .namespace(NAMESPACE),
        )?;
        let empty_reads = Counter::with_opts(
            Opts::new(
                "empty_reads_total",
                "Total zero-length reads from the statsd socket.",
            )
            .namespace(NAMESPACE),
        )?;
        let parse_errors = CounterVec::new(
            Opts::new("parse_errors_total", "Datagram parse failures by error type.")
                .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let records_enqueued = CounterVec::new(
            Opts::new(
                "records_enqueued_total",
                "Records accepted into the buffer by measure kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let enqueue_retries = Counter::with_opts(
            Opts::new(
                "enqueue_retries_total",
                "Enqueue attempts rejected because the buffer was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_dropped = Counter::with_opts(
            Opts::new(
                "records_dropped_total",
                "Parsed records dropped before reaching the buffer.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Buffer ===
        let buffer_occupancy = Gauge::with_opts(
            Opts::new("buffer_occupancy", "Current number of buffered records.")
                .namespace(NAMESPACE),
        )?;
        let buffer_capacity = Gauge::with_opts(
            Opts::new("buffer_capacity", "Buffer flush threshold in records.")
                .namespace(NAMESPACE),
        )?;

        // === Flush ===
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Flush attempts by trigger and outcome.")
                .namespace(NAMESPACE),
            &["trigger", "outcome"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Flush duration by trigger.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["trigger"],
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Records drained per flush.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;

        // === Warehouse ===
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "ClickHouse connection state (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Rows written by destination table.")
                .namespace(NAMESPACE),
            &["table"],
        )?;
        let write_errors = CounterVec::new(
            Opts::new(
                "write_errors_total",
                "Failed destination table writes by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let cast_failures = CounterVec::new(
            Opts::new(
                "cast_failures_total",
                "Columns shipped uncast by table and column.",
            )
            .namespace(NAMESPACE),
            &["table", "column"],
        )?;
        let clickhouse_batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_batch_duration_seconds",
                "ClickHouse insert duration by table.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["table"],
        )?;

        registry.register(Box::new(datagrams_received.clone()))?;
        registry.register(Box::new(empty_reads.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(records_enqueued.clone()))?;
        registry.register(Box::new(enqueue_retries.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(buffer_occupancy.clone()))?;
        registry.register(Box::new(buffer_capacity.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(cast_failures.clone()))?;
        registry.register(Box::new(clickhouse_batch_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            datagrams_received,
            empty_reads,
            parse_errors,
            records_enqueued,
            enqueue_retries,
            records_dropped,
            buffer_occupancy,
            buffer_capacity,
            flushes,
            flush_duration,
            flush_batch_size,
            clickhouse_connected,
            rows_written,
            write_errors,
            cast_failures,
            clickhouse_batch_duration,
        })
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
