pub mod collector;
pub mod config;
pub mod export;
pub mod ingest;
pub mod migrate;
pub mod retry;
pub mod sink;
pub mod statsd;
