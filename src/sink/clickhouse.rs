use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;

use super::batch::{RowSet, Value};
use super::schema::ColumnType;
use super::warehouse::Warehouse;

/// ClickHouse warehouse for the counts, last and timers tables.
///
/// Resolves column types from `system.columns` and inserts each row set as
/// a single `INSERT ... VALUES` statement over the native protocol.
pub struct ClickHouseWarehouse {
    pool: Pool,
    database: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseWarehouse {
    /// Creates a new warehouse on an already connected pool.
    pub fn new(pool: Pool, database: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }

    fn observe_batch_duration(&self, table: &str, started: Instant) {
        if let Some(health) = &self.health {
            health
                .clickhouse_batch_duration
                .with_label_values(&[table])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

impl Warehouse for ClickHouseWarehouse {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn resolve_column_types(
        &self,
        table: &str,
        columns: &[&str],
    ) -> Result<HashMap<String, ColumnType>> {
        let sql = build_schema_query(&self.database, table, columns);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for schema lookup")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying columns of {}.{table}", self.database))?;

        let mut types = HashMap::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("name").context("reading column name")?;
            let raw_type: String = row.get("type").context("reading column type")?;
            types.insert(name, ColumnType::from_type_name(&raw_type));
        }

        Ok(types)
    }

    async fn write_batch(&self, table: &str, rows: &RowSet) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = build_insert(&self.database, table, rows);
        let started = Instant::now();

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {table} insert"))?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("sending {table} batch"))?;

        self.observe_batch_duration(table, started);

        Ok(())
    }
}

// --- SQL formatting helpers ---

fn build_schema_query(database: &str, table: &str, columns: &[&str]) -> String {
    let mut sql = String::with_capacity(128 + columns.len() * 16);
    let _ = write!(
        sql,
        "SELECT name, type FROM system.columns WHERE database = '{}' AND table = '{}'",
        escape_sql(database),
        escape_sql(table),
    );

    if !columns.is_empty() {
        sql.push_str(" AND name IN (");
        for (idx, column) in columns.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "'{}'", escape_sql(column));
        }
        sql.push(')');
    }

    sql
}

fn build_insert(database: &str, table: &str, rows: &RowSet) -> String {
    let columns = rows.columns();
    let mut sql = String::with_capacity(64 + rows.len() * columns.len() * 24);

    let _ = write!(
        sql,
        "INSERT INTO {}.{} (",
        quote_ident(database),
        quote_ident(table)
    );
    for (idx, column) in columns.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&quote_ident(&column.name));
    }
    sql.push_str(") VALUES ");

    for row in 0..rows.len() {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (idx, column) in columns.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            match column.values.get(row) {
                Some(value) => append_literal(&mut sql, value),
                None => sql.push_str("NULL"),
            }
        }
        sql.push(')');
    }

    sql
}

/// Renders a value as a ClickHouse SQL literal.
fn append_literal(buf: &mut String, value: &Value) {
    match value {
        Value::Null => buf.push_str("NULL"),
        Value::Int(i) => {
            let _ = write!(buf, "{i}");
        }
        Value::Float(f) => {
            if f.is_nan() {
                buf.push_str("nan");
            } else if f.is_infinite() {
                buf.push_str(if *f > 0.0 { "inf" } else { "-inf" });
            } else {
                let _ = write!(buf, "{f}");
            }
        }
        Value::Str(s) => {
            let _ = write!(buf, "'{}'", escape_sql(s));
        }
        Value::Bool(b) => {
            let _ = write!(buf, "{b}");
        }
        Value::Timestamp(t) => {
            let _ = write!(buf, "'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        Value::Date(d) => {
            let _ = write!(buf, "'{}'", d.format("%Y-%m-%d"));
        }
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quote_ident(s: &str) -> String {
    format!("`{}`", s.replace('\\', "\\\\").replace('`', "\\`"))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate};

    use super::*;
    use crate::sink::batch::{AggregatedRow, Column};

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("hello"), "hello");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("check"), "`check`");
        assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
    }

    #[test]
    fn test_schema_query() {
        let sql = build_schema_query("default", "airflow_counts", &["app", "value"]);
        assert_eq!(
            sql,
            "SELECT name, type FROM system.columns WHERE database = 'default' \
             AND table = 'airflow_counts' AND name IN ('app', 'value')"
        );
    }

    #[test]
    fn test_literals() {
        let render = |v: Value| {
            let mut s = String::new();
            append_literal(&mut s, &v);
            s
        };

        assert_eq!(render(Value::Null), "NULL");
        assert_eq!(render(Value::Int(-4)), "-4");
        assert_eq!(render(Value::Float(1.5)), "1.5");
        assert_eq!(render(Value::Float(f64::NAN)), "nan");
        assert_eq!(render(Value::Float(f64::NEG_INFINITY)), "-inf");
        assert_eq!(render(Value::Str("o'clock".to_string())), "'o\\'clock'");
        assert_eq!(render(Value::Bool(true)), "true");
        assert_eq!(
            render(Value::Timestamp(DateTime::from_timestamp(0, 0).unwrap())),
            "'1970-01-01 00:00:00.000'"
        );
        assert_eq!(
            render(Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())),
            "'2024-02-29'"
        );
    }

    #[test]
    fn test_build_insert() {
        let rows = RowSet::from_rows(&[
            AggregatedRow {
                app: "airflow".to_string(),
                domain: "scheduler_heartbeat".to_string(),
                check: None,
                name: None,
                value: 3.0,
                timestamp: 1.5,
            },
            AggregatedRow {
                app: "airflow".to_string(),
                domain: "pool".to_string(),
                check: Some("open_slots".to_string()),
                name: Some("default_pool".to_string()),
                value: 128.0,
                timestamp: 2.0,
            },
        ]);

        let sql = build_insert("default", "airflow_counts", &rows);
        assert_eq!(
            sql,
            "INSERT INTO `default`.`airflow_counts` (`app`, `domain`, `check`, `name`, `value`, `timestamp`) \
             VALUES ('airflow', 'scheduler_heartbeat', NULL, NULL, 3, 1.5), \
             ('airflow', 'pool', 'open_slots', 'default_pool', 128, 2)"
        );
    }

    #[test]
    fn test_build_insert_short_column_renders_null() {
        let rows = RowSet::from_columns(vec![
            Column {
                name: "a".to_string(),
                values: vec![Value::Int(1), Value::Int(2)],
            },
            Column {
                name: "b".to_string(),
                values: vec![Value::Int(3)],
            },
        ]);
        let sql = build_insert("db", "t", &rows);
        assert!(sql.ends_with("VALUES (1, 3), (2, NULL)"));
    }
}
