use std::fmt;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use tracing::info;

use crate::config::ClickHouseConfig;

struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Embedded migrations, ordered by version.
///
/// SQL text carries `{database}`, `{counts_table}`, `{last_table}` and
/// `{timers_table}` placeholders, filled from configuration before use.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applied schema version. `dirty` marks a migration that started but
/// never completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationState {
    pub version: u32,
    pub dirty: bool,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version {}", self.version)?;
        if self.dirty {
            f.write_str(" (dirty)")?;
        }
        Ok(())
    }
}

/// Manages the destination table schema.
///
/// Applied versions live in a golang-migrate compatible
/// `schema_migrations` table.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn status(&self) -> impl std::future::Future<Output = Result<MigrationState>> + Send;
}

/// Names substituted into migration SQL.
#[derive(Debug, Clone)]
pub struct SchemaNames {
    pub database: String,
    pub counts_table: String,
    pub last_table: String,
    pub timers_table: String,
}

impl SchemaNames {
    pub fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self {
            database: cfg.database.clone(),
            counts_table: cfg.counts_table.clone(),
            last_table: cfg.last_table.clone(),
            timers_table: cfg.timers_table.clone(),
        }
    }

    /// Fills the placeholders of a migration with backtick-quoted names.
    fn render(&self, sql: &str) -> String {
        [
            ("{database}", &self.database),
            ("{counts_table}", &self.counts_table),
            ("{last_table}", &self.last_table),
            ("{timers_table}", &self.timers_table),
        ]
        .into_iter()
        .fold(sql.to_string(), |acc, (placeholder, name)| {
            acc.replace(placeholder, &quote_ident(name))
        })
    }
}

fn quote_ident(s: &str) -> String {
    format!("`{}`", s.replace('`', "\\`"))
}

/// Runs embedded migrations over a ClickHouse pool.
pub struct ClickHouseMigrator {
    pool: Pool,
    names: SchemaNames,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, names: SchemaNames) -> Self {
        Self { pool, names }
    }

    fn tracking_table(&self) -> String {
        format!("{}.schema_migrations", quote_ident(&self.names.database))
    }

    async fn exec(&self, sql: &str, what: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        handle.execute(sql).await.with_context(|| what.to_string())?;

        Ok(())
    }

    async fn ensure_tracking_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (version Int64, dirty UInt8, sequence UInt64) ENGINE = TinyLog",
            self.tracking_table()
        );
        self.exec(&sql, "creating schema_migrations table").await
    }

    async fn load_state(&self) -> Result<MigrationState> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let sql = format!(
            "SELECT version, dirty FROM {} ORDER BY sequence DESC LIMIT 1",
            self.tracking_table()
        );
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationState::default());
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok(MigrationState {
            version: u32::try_from(version)
                .with_context(|| format!("migration version {version} out of range"))?,
            dirty: dirty != 0,
        })
    }

    /// Replaces the tracked state; `None` leaves the table empty.
    async fn store_state(&self, state: Option<MigrationState>) -> Result<()> {
        let table = self.tracking_table();
        self.exec(&format!("TRUNCATE TABLE {table}"), "truncating schema_migrations")
            .await?;

        if let Some(state) = state {
            let sql = format!(
                "INSERT INTO {table} (version, dirty, sequence) VALUES ({}, {}, 1)",
                state.version,
                u8::from(state.dirty)
            );
            self.exec(&sql, "recording migration version").await?;
        }

        Ok(())
    }

    /// Renders a migration and executes its statements in order.
    async fn apply(&self, version: u32, sql: &str) -> Result<()> {
        let rendered = self.names.render(sql);

        for statement in split_statements(&rendered) {
            let preview: String = statement.chars().take(80).collect();
            self.exec(
                statement,
                &format!("migration {version}: executing {preview}..."),
            )
            .await?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_tracking_table().await?;

        let state = self.load_state().await?;
        if state.dirty {
            bail!("schema is at {state}, manual intervention required");
        }

        let pending: Vec<&Migration> = pending_after(state.version).collect();
        if pending.is_empty() {
            info!(version = state.version, "schema up to date");
            return Ok(());
        }

        info!(from = state.version, pending = pending.len(), "applying migrations");

        for migration in pending {
            let version = migration.version;
            info!(version, "applying migration");

            self.store_state(Some(MigrationState { version, dirty: true }))
                .await?;
            self.apply(version, migration.up_sql).await?;
            self.store_state(Some(MigrationState { version, dirty: false }))
                .await?;
        }

        info!(version = latest_version(), "migrations completed");

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_tracking_table().await?;

        let state = self.load_state().await?;
        if state.version == 0 {
            info!("no migrations to roll back");
            return Ok(());
        }

        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == state.version) else {
            bail!("migration version {} not embedded in this build", state.version);
        };

        info!(version = state.version, "rolling back migration");

        self.store_state(Some(MigrationState {
            version: state.version,
            dirty: true,
        }))
        .await?;
        self.apply(state.version, migration.down_sql).await?;

        let previous = previous_version(state.version);
        let restored = (previous > 0).then_some(MigrationState {
            version: previous,
            dirty: false,
        });
        self.store_state(restored).await?;

        info!(version = previous, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<MigrationState> {
        self.ensure_tracking_table().await?;
        self.load_state().await
    }
}

fn pending_after(version: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > version)
}

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .max()
        .unwrap_or(0)
}

/// Splits SQL text on semicolons, skipping blank statements.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
