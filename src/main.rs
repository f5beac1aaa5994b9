use std::path::{Path, PathBuf};

use airmetrics::collector::Collector;
use airmetrics::config::Config;
use airmetrics::export::ClickHouseConnection;
use airmetrics::migrate::{ClickHouseMigrator, Migrator, SchemaNames};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

/// Airflow statsd collector shipping aggregated metrics to ClickHouse.
#[derive(Parser)]
#[command(name = "airmetrics", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging filter (trace, debug, info, warn, error, or an EnvFilter
    /// directive). Overrides `log_level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Manage the destination table schema.
    Migrate {
        #[arg(value_enum)]
        direction: MigrateDirection,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateDirection {
    Up,
    Down,
    Status,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("airmetrics {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = load_config(&config_path)?;

    let filter = log_filter(cli.log_level.as_deref(), &cfg)?;
    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { direction }) => rt.block_on(migrate(cfg, direction)),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting airmetrics",
            );
            rt.block_on(run(cfg))
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

/// The CLI flag wins over the config file.
fn log_filter(cli_level: Option<&str>, cfg: &Config) -> Result<EnvFilter> {
    let level = cli_level.unwrap_or(&cfg.log_level);
    EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut collector = Collector::new(cfg)?;
    if let Err(e) = collector.start().await {
        collector.stop().await?;
        return Err(e);
    }

    let result = tokio::select! {
        _ = shutdown_rx => Ok(()),
        died = collector.wait() => died,
    };

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "pipeline task died, shutting down");
    }

    collector.stop().await?;

    tracing::info!("airmetrics stopped");

    result
}

async fn wait_for_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                None
            }
        };

    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

async fn migrate(cfg: Config, direction: MigrateDirection) -> Result<()> {
    let mut connection = ClickHouseConnection::new(cfg.clickhouse.clone(), None);
    connection
        .start()
        .await
        .context("connecting to ClickHouse")?;
    let pool = connection
        .pool()
        .context("ClickHouse pool missing after start")?;

    let migrator = ClickHouseMigrator::new(pool, SchemaNames::from_config(&cfg.clickhouse));

    let result = match direction {
        MigrateDirection::Up => migrator.up().await,
        MigrateDirection::Down => migrator.down().await,
        MigrateDirection::Status => migrator
            .status()
            .await
            .map(|state| println!("schema at {state}")),
    };

    connection.stop().await?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_falls_back_to_config() {
        let cfg = Config::from_yaml("log_level: debug\n").unwrap();
        let filter = log_filter(None, &cfg).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_log_filter_cli_overrides_config() {
        let cfg = Config::from_yaml("log_level: debug\n").unwrap();
        let filter = log_filter(Some("warn"), &cfg).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_log_filter_rejects_invalid_directive() {
        let cfg = Config::default();
        let err = log_filter(Some("airmetrics=notalevel"), &cfg).unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }
}
