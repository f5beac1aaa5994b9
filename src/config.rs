use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the airmetrics collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging filter (debug, info, warn, error, or an EnvFilter directive).
    /// The `--log-level` flag takes precedence. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Statsd UDP listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// In-memory record buffer configuration.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Flush scheduling configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Backoff for buffer-full and empty-read retries.
    #[serde(default)]
    pub retry: RetryConfig,

    /// ClickHouse warehouse configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Statsd UDP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Bind address. Default: "0.0.0.0".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Bind port. Default: 8125.
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Largest datagram read in one call; longer ones are truncated.
    /// Default: 1024.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Kernel receive buffer size in bytes. Unset keeps the OS default.
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,
}

/// In-memory record buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Occupancy that triggers a capacity flush. Default: 1000.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Extra room above `capacity` before producers back off. Default: 50.
    #[serde(default = "default_slack")]
    pub slack: usize,
}

/// Flush scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Maximum time between flushes of a non-empty buffer. Default: 15s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How often the capacity watcher checks occupancy. Default: 1s.
    #[serde(default = "default_capacity_poll_interval", with = "humantime_serde")]
    pub capacity_poll_interval: Duration,

    /// Records drained per flush. Default: `buffer.capacity`.
    #[serde(default)]
    pub max_batch: Option<usize>,

    /// Treat a failed flush as fatal for the process. Default: false.
    #[serde(default)]
    pub fail_fast: bool,
}

/// Backoff for buffer-full and empty-read retries.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay. Default: 4s.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Backoff cap. Default: 20s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Retries before the ingestion worker fails. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Destination of summed counters. Default: "airflow_counts".
    #[serde(default = "default_counts_table")]
    pub counts_table: String,

    /// Destination of last-value gauges. Default: "airflow_last".
    #[serde(default = "default_last_table")]
    pub last_table: String,

    /// Destination of retained timers. Default: "airflow_timers".
    #[serde(default = "default_timers_table")]
    pub timers_table: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8125
}

fn default_max_datagram_size() -> usize {
    1024
}

fn default_capacity() -> usize {
    1000
}

fn default_slack() -> usize {
    50
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_capacity_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(4)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(20)
}

fn default_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_counts_table() -> String {
    "airflow_counts".to_string()
}

fn default_last_table() -> String {
    "airflow_last".to_string()
}

fn default_timers_table() -> String {
    "airflow_timers".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listener: ListenerConfig::default(),
            buffer: BufferConfig::default(),
            flush: FlushConfig::default(),
            retry: RetryConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
            max_datagram_size: default_max_datagram_size(),
            recv_buffer_size: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            slack: default_slack(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
            capacity_poll_interval: default_capacity_poll_interval(),
            max_batch: None,
            fail_fast: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_attempts: None,
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            counts_table: default_counts_table(),
            last_table: default_last_table(),
            timers_table: default_timers_table(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding yaml")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listener.address.is_empty() {
            bail!("listener.address is required");
        }

        if self.listener.max_datagram_size == 0 {
            bail!("listener.max_datagram_size must be positive");
        }

        if self.buffer.capacity == 0 {
            bail!("buffer.capacity must be positive");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        if self.flush.capacity_poll_interval.is_zero() {
            bail!("flush.capacity_poll_interval must be positive");
        }

        if self.flush.max_batch == Some(0) {
            bail!("flush.max_batch must be positive");
        }

        if self.retry.initial_backoff.is_zero() {
            bail!("retry.initial_backoff must be positive");
        }

        if self.retry.max_backoff.is_zero() {
            bail!("retry.max_backoff must be positive");
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            bail!(
                "retry.initial_backoff {:?} must not exceed retry.max_backoff {:?}",
                self.retry.initial_backoff,
                self.retry.max_backoff
            );
        }

        if self.retry.max_attempts == Some(0) {
            bail!("retry.max_attempts must be at least 1 when set");
        }

        let ch = &self.clickhouse;
        if ch.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if ch.database.is_empty() {
            bail!("clickhouse.database is required");
        }

        let mut seen = HashSet::new();
        for (key, table) in [
            ("counts_table", &ch.counts_table),
            ("last_table", &ch.last_table),
            ("timers_table", &ch.timers_table),
        ] {
            if table.is_empty() {
                bail!("clickhouse.{key} is required");
            }
            if !seen.insert(table.as_str()) {
                bail!("clickhouse.{key} {table:?} is used for more than one measure");
            }
        }

        Ok(())
    }

    /// Records drained per flush, falling back to the buffer capacity.
    pub fn max_batch(&self) -> usize {
        self.flush.max_batch.unwrap_or(self.buffer.capacity)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.listener.port, 8125);
        assert_eq!(cfg.listener.max_datagram_size, 1024);
        assert_eq!(cfg.buffer.capacity, 1000);
        assert_eq!(cfg.buffer.slack, 50);
        assert_eq!(cfg.flush.interval, Duration::from_secs(15));
        assert_eq!(cfg.flush.capacity_poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.retry.initial_backoff, Duration::from_secs(4));
        assert_eq!(cfg.retry.max_backoff, Duration::from_secs(20));
        assert_eq!(cfg.retry.max_attempts, None);
        assert_eq!(cfg.clickhouse.counts_table, "airflow_counts");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.max_batch(), 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.listener.address, "0.0.0.0");
        assert_eq!(cfg.clickhouse.endpoint, "localhost:9000");
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
listener:
  address: 127.0.0.1
  port: 9125
  max_datagram_size: 2048
  recv_buffer_size: 4194304
buffer:
  capacity: 500
  slack: 20
flush:
  interval: 30s
  capacity_poll_interval: 250ms
  fail_fast: true
retry:
  initial_backoff: 1s
  max_backoff: 10s
  max_attempts: 5
clickhouse:
  endpoint: ch:9000
  database: airflow
  username: writer
  password: secret
  counts_table: c
  last_table: l
  timers_table: t
  migrations:
    enabled: true
health:
  addr: 127.0.0.1:9191
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.listener.port, 9125);
        assert_eq!(cfg.listener.recv_buffer_size, Some(4_194_304));
        assert_eq!(cfg.buffer.capacity, 500);
        assert_eq!(cfg.flush.interval, Duration::from_secs(30));
        assert_eq!(cfg.flush.capacity_poll_interval, Duration::from_millis(250));
        assert!(cfg.flush.fail_fast);
        assert_eq!(cfg.max_batch(), 500);
        assert_eq!(cfg.retry.max_attempts, Some(5));
        assert_eq!(cfg.clickhouse.database, "airflow");
        assert!(cfg.clickhouse.migrations.enabled);
        assert_eq!(cfg.health.addr, "127.0.0.1:9191");
    }

    #[test]
    fn test_explicit_max_batch() {
        let cfg = Config::from_yaml("flush:\n  max_batch: 200\n").unwrap();
        assert_eq!(cfg.max_batch(), 200);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut cfg = Config::default();
        cfg.buffer.capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("buffer.capacity"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.flush.interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.retry.initial_backoff = Duration::from_secs(30);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("initial_backoff"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.retry.max_attempts = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_tables() {
        let mut cfg = Config::default();
        cfg.clickhouse.timers_table = cfg.clickhouse.counts_table.clone();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("timers_table"));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let mut cfg = Config::default();
        cfg.clickhouse.endpoint.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer:\n  capacity: 42").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.buffer.capacity, 42);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/airmetrics.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading config file"));
    }

    #[test]
    fn test_load_reports_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "flush:\n  interval: 0s").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("flush.interval"));
    }
}
