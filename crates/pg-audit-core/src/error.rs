//! Domain error types for the PostgreSQL audit proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::time::Duration;

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Relay buffer size must be positive and bounded.
    #[error("relay buffer_size must be between 1 and {max} bytes, got {size}")]
    InvalidBufferSize { size: usize, max: usize },

    /// Connection limit must be at least one.
    #[error("listen max_connections must be at least 1")]
    ZeroMaxConnections,

    /// Backend connect timeout must be positive.
    #[error("backend connect_timeout_ms must be greater than zero")]
    ZeroConnectTimeout,

    /// Audit log path must not be empty.
    #[error("audit path must not be empty")]
    EmptyAuditPath,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),
}

/// Errors that occur during proxy operation.
///
/// Everything except setup failures is scoped to a single connection pair:
/// the pair task returns the error, the pair is torn down and the listener
/// keeps serving.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The backend could not be reached for this pair.
    #[error("backend {address} unavailable: {message}")]
    BackendUnavailable { address: String, message: String },

    /// A send-until-complete transfer stopped before every byte was written.
    #[error("send to {peer} failed after {sent} of {total} bytes: {source}")]
    SendFailed {
        peer: &'static str,
        sent: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },

    /// A peer stayed silent longer than the idle timeout.
    #[error("{peer} idle for more than {timeout:?}")]
    IdleTimeout {
        peer: &'static str,
        timeout: Duration,
    },

    /// The audit log could not be opened.
    #[error("audit log '{path}' unavailable: {source}")]
    AuditUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Shutdown signal received.
    #[error("proxy shutting down")]
    Shutdown,
}

impl ProxyError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "io",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::SendFailed { .. } => "send_failed",
            Self::IdleTimeout { .. } => "idle_timeout",
            Self::AuditUnavailable { .. } => "audit_unavailable",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
