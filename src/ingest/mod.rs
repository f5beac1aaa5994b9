//! Statsd ingestion: UDP listener and the worker feeding the buffer.

pub mod listener;
pub mod worker;

pub use listener::StatsdListener;
pub use worker::IngestWorker;
