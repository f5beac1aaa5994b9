use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;

use super::batch::RowSet;
use super::schema::ColumnType;

/// Warehouse receives adapted row sets from the flush path.
///
/// Implementations must be shareable across the watcher tasks; every call
/// is made by whichever task currently holds the flush guard.
pub trait Warehouse: Send + Sync + 'static {
    /// Returns the warehouse name for logging.
    fn name(&self) -> &str;

    /// Looks up the declared type of each requested column of `table`.
    /// Columns unknown to the table are absent from the result.
    fn resolve_column_types(
        &self,
        table: &str,
        columns: &[&str],
    ) -> impl Future<Output = Result<HashMap<String, ColumnType>>> + Send;

    /// Appends all rows of `rows` to `table`.
    fn write_batch(&self, table: &str, rows: &RowSet)
        -> impl Future<Output = Result<()>> + Send;
}
