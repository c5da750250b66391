//! Configuration types for the PostgreSQL audit proxy.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section has defaults, so an empty document yields a working proxy that
//! listens on `0.0.0.0:6432` and relays to `127.0.0.1:5432`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Upper bound for the relay buffer.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// TCP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Backend database configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Relay behaviour between client and backend.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Audit log configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:6432".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Maximum number of concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Listen backlog. The kernel silently clamps it to its own maximum.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// How long to wait for live pairs to finish after shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

/// Backend database connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend address. Supports environment variable expansion: "${PG_BACKEND}".
    #[serde(default = "default_backend_address")]
    pub address: String,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm on backend sockets.
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

/// How bytes are shuttled between the two sides of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// One client read, forwarded, then exactly one backend read relayed back.
    ///
    /// Backend messages sent outside a client request are not relayed until
    /// the client speaks again.
    #[default]
    RequestReply,
    /// Both directions are copied independently.
    FullDuplex,
}

impl RelayMode {
    /// Name as used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestReply => "request_reply",
            Self::FullDuplex => "full_duplex",
        }
    }
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "request_reply" => Ok(Self::RequestReply),
            "full_duplex" => Ok(Self::FullDuplex),
            other => Err(format!(
                "unknown relay mode '{other}' (expected request_reply or full_duplex)"
            )),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Relay mode.
    #[serde(default)]
    pub mode: RelayMode,

    /// Size of the per-read buffer in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum time a read may wait for data, in milliseconds. 0 disables.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl RelayConfig {
    /// Idle timeout as a duration, `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Append-only audit file.
    /// Supports environment variable expansion: "${PG_AUDIT_DIR}/requests.log".
    #[serde(default = "default_audit_path")]
    pub path: String,
}

impl AuditConfig {
    /// Get the audit path with environment variables expanded.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.path))
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn parse_host_port(addr: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:6432".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_backlog() -> u32 {
    4096
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_backend_address() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_nodelay() -> bool {
    true
}

fn default_buffer_size() -> usize {
    8192
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_audit_path() -> String {
    "requests.log".to_string()
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_address() -> String {
    "0.0.0.0:9187".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: default_backend_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: default_nodelay(),
        }
    }
}

impl BackendConfig {
    /// Get the backend address with environment variables expanded.
    #[must_use]
    pub fn address(&self) -> String {
        expand_env_vars(&self.address)
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            buffer_size: default_buffer_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl ProxyConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        // An empty document parses to unit, not to an empty mapping.
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        parse_host_port(&self.listen.address)?;
        parse_host_port(&self.backend.address())?;

        if self.listen.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }

        if self.backend.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroConnectTimeout);
        }

        if self.relay.buffer_size == 0 || self.relay.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidBufferSize {
                size: self.relay.buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }

        if self.audit.path().as_os_str().is_empty() {
            return Err(ConfigError::EmptyAuditPath);
        }

        if self.metrics.enabled {
            parse_host_port(&self.metrics.address)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend.address(), "127.0.0.1:5432");
        assert_eq!(config.relay.mode, RelayMode::RequestReply);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ProxyConfig::from_str("").unwrap();
        assert_eq!(config.listen.address, "0.0.0.0:6432");
        assert_eq!(config.audit.path(), PathBuf::from("requests.log"));
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
listen:
  address: '127.0.0.1:7432'
  max_connections: 50
backend:
  address: 'db.internal:5433'
  connect_timeout_ms: 2500
relay:
  mode: full_duplex
  buffer_size: 16384
  idle_timeout_ms: 0
audit:
  path: '/var/log/pg-audit/requests.log'
";
        let config = ProxyConfig::from_str(yaml).unwrap();
        assert_eq!(config.listen.max_connections, 50);
        assert_eq!(config.backend.address(), "db.internal:5433");
        assert_eq!(config.backend.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(config.relay.mode, RelayMode::FullDuplex);
        assert_eq!(config.relay.buffer_size, 16384);
        assert!(config.relay.idle_timeout().is_none());
        assert_eq!(
            config.audit.path(),
            PathBuf::from("/var/log/pg-audit/requests.log")
        );
    }

    #[test]
    fn test_default_values_applied() {
        let yaml = r"
listen:
  address: '0.0.0.0:6432'
";
        let config = ProxyConfig::from_str(yaml).unwrap();
        assert_eq!(config.listen.backlog, 4096);
        assert_eq!(config.relay.buffer_size, 8192);
        assert_eq!(
            config.relay.idle_timeout(),
            Some(Duration::from_millis(600_000))
        );
        assert!(config.backend.nodelay);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_zero_buffer_size_rejected() {
        let mut config = ProxyConfig::default();
        config.relay.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferSize { size: 0, .. })
        ));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let mut config = ProxyConfig::default();
        config.relay.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferSize { .. })
        ));
    }

    #[test]
    fn test_invalid_backend_address() {
        let mut config = ProxyConfig::default();
        config.backend.address = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));

        config.backend.address = "localhost:notaport".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = ProxyConfig::default();
        config.listen.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroMaxConnections)
        ));

        let mut config = ProxyConfig::default();
        config.backend.connect_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroConnectTimeout)
        ));
    }

    #[test]
    fn test_ipv6_listen_address() {
        let mut config = ProxyConfig::default();
        config.listen.address = "[::1]:6432".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_mode_parsing() {
        assert_eq!("full-duplex".parse::<RelayMode>(), Ok(RelayMode::FullDuplex));
        assert_eq!(
            "REQUEST_REPLY".parse::<RelayMode>(),
            Ok(RelayMode::RequestReply)
        );
        assert!("bidirectional".parse::<RelayMode>().is_err());
        assert_eq!(RelayMode::FullDuplex.as_str(), "full_duplex");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_PG_AUDIT_DIR", "/tmp/audit");
        std::env::set_var("TEST_PG_BACKEND", "10.0.0.5:5432");

        let audit = AuditConfig {
            path: "${TEST_PG_AUDIT_DIR}/requests.log".to_string(),
        };
        let backend = BackendConfig {
            address: "${TEST_PG_BACKEND}".to_string(),
            ..BackendConfig::default()
        };

        assert_eq!(audit.path(), PathBuf::from("/tmp/audit/requests.log"));
        assert_eq!(backend.address(), "10.0.0.5:5432");

        std::env::remove_var("TEST_PG_AUDIT_DIR");
        std::env::remove_var("TEST_PG_BACKEND");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        let audit = AuditConfig {
            path: "${NONEXISTENT_PG_AUDIT_VAR}".to_string(),
        };
        let mut config = ProxyConfig::default();
        config.audit = audit;
        assert!(matches!(config.validate(), Err(ConfigError::EmptyAuditPath)));
    }
}
