//! UDP load generator: sends a random mix of Airflow statsd samples to a
//! running collector.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tracing_subscriber::{fmt, EnvFilter};

/// Datagrams a stock Airflow scheduler emits.
const SAMPLES: &[&str] = &[
    "airflow.scheduler.critical_section_duration:8.494474|ms",
    "airflow.executor.open_slots:32|g",
    "airflow.executor.queued_tasks:0|g",
    "airflow.executor.running_tasks:0|g",
    "airflow.scheduler_heartbeat:1|c",
    "airflow.pool.open_slots.default_pool:128|g",
    "airflow.pool.queued_slots.default_pool:0|g",
    "airflow.scheduler.critical_section_duration:8.162927|ms",
    "airflow.dag_processing.total_parse_time:11.112728387117386|g",
    "airflow.dagbag_size:22|g",
    "airflow.dag_processing.processes:1|c",
];

#[derive(Parser)]
#[command(name = "airmetrics-load", about = "Send sample Airflow metrics over UDP")]
struct Cli {
    /// Collector host.
    #[arg(short = 'i', long, default_value = "127.0.0.1")]
    host: String,

    /// Collector port.
    #[arg(short, long, default_value_t = 8125)]
    port: u16,

    /// Number of datagrams to send.
    #[arg(short, long)]
    num_messages: usize,

    /// Pause between datagrams in milliseconds. Sends back to back when unset.
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let interval = cli.interval_ms.map(Duration::from_millis);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding sender socket")?;
    socket
        .connect((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("resolving {}:{}", cli.host, cli.port))?;

    let started = Instant::now();
    let mut rng = rand::thread_rng();

    for _ in 0..cli.num_messages {
        let Some(line) = SAMPLES.choose(&mut rng) else {
            break;
        };
        tracing::debug!(line = *line, "sending");
        socket
            .send(line.as_bytes())
            .await
            .context("sending datagram")?;

        if let Some(interval) = interval {
            tokio::time::sleep(interval).await;
        }
    }

    tracing::info!(
        sent = cli.num_messages,
        dest = %format!("{}:{}", cli.host, cli.port),
        elapsed = ?started.elapsed(),
        "load run finished",
    );

    Ok(())
}
