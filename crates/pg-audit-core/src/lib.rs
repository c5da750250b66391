//! PostgreSQL audit proxy core library
//!
//! This library provides the core of a TCP proxy that sits between
//! PostgreSQL clients and a single backend server. It refuses TLS
//! negotiation so traffic stays in clear text, relays bytes in both
//! directions, and appends every SQL command keyword it sees to an audit
//! log.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`protocol`] - `SSLRequest` interception
//! - [`network`] - Listener, backend connector, pair registry and relay
//! - [`audit`] - Command extraction and the append-only audit log
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pg_audit_core::audit::{AuditLogger, FileAuditSink};
//! use pg_audit_core::config::ProxyConfig;
//! use pg_audit_core::metrics::ProxyMetrics;
//! use pg_audit_core::network::ProxyListener;
//!
//! let config = ProxyConfig::from_file("config.yaml")?;
//! let metrics = Arc::new(ProxyMetrics::new());
//! let sink = FileAuditSink::open(config.audit.path()).await?;
//! let audit = Arc::new(AuditLogger::new(sink).with_metrics(Arc::clone(&metrics)));
//!
//! ProxyListener::new(config, audit, metrics).run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use audit::{AuditLogger, AuditSink, FileAuditSink, MemoryAuditSink};
pub use config::{ProxyConfig, RelayMode};
pub use error::{ConfigError, ProxyError, Result};
pub use metrics::ProxyMetrics;
pub use network::{ConnectionRegistry, ProxyListener};
