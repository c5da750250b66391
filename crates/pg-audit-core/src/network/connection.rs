//! Per-client pair handler.
//!
//! Takes an accepted client socket through the whole pair lifecycle:
//! TLS refusal, backend connect, registry insertion, relay and teardown.
//! Every failure is returned to the spawning task and never leaves this
//! pair.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::audit::AuditLogger;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::protocol::{HandshakeInterceptor, HandshakeOutcome};

use super::backend::BackendConnector;
use super::registry::ConnectionRegistry;
use super::relay::{PairEnd, Relay};

/// Handles a single client connection and its backend counterpart.
pub struct ConnectionHandler {
    config: Arc<ProxyConfig>,
    audit: Arc<AuditLogger>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ProxyMetrics>,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    /// Create a new connection handler.
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        audit: Arc<AuditLogger>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ProxyMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            audit,
            registry,
            metrics,
            shutdown,
        }
    }

    /// Handle the connection until either side closes.
    ///
    /// Returns `Ok(None)` when the client left before sending anything, so
    /// no pair was opened.
    ///
    /// # Errors
    ///
    /// Returns the error that ended this pair: the backend could not be
    /// reached, a read or write failed, a read timed out, or the proxy is
    /// shutting down.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn handle(self, mut client: TcpStream, peer: SocketAddr) -> Result<Option<PairEnd>> {
        let relay_config = &self.config.relay;
        let interceptor = HandshakeInterceptor::new(relay_config.buffer_size)
            .with_idle_timeout(relay_config.idle_timeout());

        let outcome = tokio::select! {
            outcome = interceptor.intercept(&mut client) => outcome?,
            () = self.shutdown.cancelled() => return Err(ProxyError::Shutdown),
        };

        let initial = match outcome {
            HandshakeOutcome::Refused => {
                self.metrics.record_ssl_refused();
                None
            }
            HandshakeOutcome::Passthrough(bytes) => Some(bytes),
            HandshakeOutcome::Closed => return Ok(None),
        };

        let connector = BackendConnector::from_config(&self.config.backend);
        let connected = tokio::select! {
            connected = connector.connect() => connected,
            () = self.shutdown.cancelled() => return Err(ProxyError::Shutdown),
        };
        let mut backend = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.metrics.record_backend_failure();
                return Err(e);
            }
        };
        let backend_addr = backend.peer_addr()?;

        let guard = self.registry.open(peer, backend_addr);
        let connection_id = guard.id();
        let cancellation = guard.cancellation();
        self.metrics.pair_opened();
        info!(connection_id = %connection_id, backend = %backend_addr, "pair opened");

        let relay = Relay::new(connection_id, &self.audit, relay_config.buffer_size)
            .with_metrics(&self.metrics)
            .with_idle_timeout(relay_config.idle_timeout());

        let result = tokio::select! {
            result = relay.run(relay_config.mode, &mut client, &mut backend, initial) => result,
            () = cancellation.cancelled() => Err(ProxyError::Shutdown),
            () = self.shutdown.cancelled() => Err(ProxyError::Shutdown),
        };

        drop(client);
        drop(backend);
        let age = guard
            .close()
            .map(|info| info.age())
            .unwrap_or_default();

        let outcome = match &result {
            Ok(end) => end.as_str(),
            Err(e) => e.kind(),
        };
        self.metrics.pair_closed(outcome, age.as_secs_f64());
        if let Err(e) = &result {
            if !matches!(e, ProxyError::Shutdown) {
                self.metrics.record_pair_error(e.kind());
            }
        }
        debug!(connection_id = %connection_id, outcome, elapsed = ?age, "pair closed");

        result.map(Some)
    }
}
