//! Metrics collection for the PostgreSQL audit proxy.
//!
//! Provides Prometheus-compatible metrics for monitoring connection pairs,
//! handshake interception and audit volume.

pub mod prometheus;

pub use self::prometheus::ProxyMetrics;
