//! Prometheus metrics fed from the progress event stream.

pub mod prometheus;

pub use prometheus::{Metrics, MetricsServer};
