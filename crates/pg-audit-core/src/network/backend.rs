//! Outbound connections to the backend database.
//!
//! One connection is opened per accepted client. A failure here only ever
//! affects the pair that asked for it.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to a fixed backend endpoint.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    address: String,
    connect_timeout: Duration,
    nodelay: bool,
}

impl BackendConnector {
    /// Create a connector for `address` with the default timeout.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    /// Create a connector from the backend configuration.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            address: config.address(),
            connect_timeout: config.connect_timeout(),
            nodelay: config.nodelay,
        }
    }

    /// Override the connection timeout.
    #[must_use]
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Get the backend address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BackendUnavailable`] if the address cannot be
    /// resolved, the connection is refused, or the timeout elapses.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn connect(&self) -> Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to backend");
                return Err(ProxyError::BackendUnavailable {
                    address: self.address.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(timeout = ?self.connect_timeout, "backend connection timeout");
                return Err(ProxyError::BackendUnavailable {
                    address: self.address.clone(),
                    message: "connection timeout".to_string(),
                });
            }
        };

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "could not set TCP_NODELAY on backend socket");
            }
        }

        debug!("backend connection established");
        Ok(stream)
    }
}
