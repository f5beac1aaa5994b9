//! Buffering and flush engine: bounded buffer, flush coordinator,
//! watchers, aggregation, schema adaptation and the warehouse seam.

pub mod aggregate;
pub mod batch;
pub mod buffer;
pub mod clickhouse;
pub mod dimension;
pub mod flush;
pub mod schema;
pub mod warehouse;
pub mod watcher;

pub use buffer::{BufferFull, RecordBuffer};
pub use flush::{FlushCoordinator, FlushOutcome, FlushTrigger, TableNames};
pub use warehouse::Warehouse;
