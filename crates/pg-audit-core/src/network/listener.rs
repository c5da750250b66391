//! TCP listener for accepting PostgreSQL client connections.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to the connection handler for the pair lifecycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::AuditLogger;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;

use super::connection::ConnectionHandler;
use super::registry::ConnectionRegistry;

/// Interval between checks while draining live pairs.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// TCP listener that accepts client connections.
pub struct ProxyListener {
    config: Arc<ProxyConfig>,
    audit: Arc<AuditLogger>,
    metrics: Arc<ProxyMetrics>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl ProxyListener {
    /// Create a new proxy listener.
    #[must_use]
    pub fn new(config: ProxyConfig, audit: Arc<AuditLogger>, metrics: Arc<ProxyMetrics>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            audit,
            metrics,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Registry of live pairs.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the listening socket with address reuse and the configured
    /// backlog.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve or the socket cannot
    /// be bound or put into listening state.
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = &self.config.listen.address;
        let addr: SocketAddr = lookup_host(address).await?.next().ok_or_else(|| {
            ProxyError::Connection(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{address} did not resolve"),
            ))
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.config.listen.backlog)?)
    }

    /// Bind and run the listener, accepting connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and the
    /// loop continues.
    #[instrument(skip(self, listener), fields(address = %self.config.listen.address))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(local) = listener.local_addr() {
            info!(address = %local, backend = %self.config.backend.address(), "proxy listening");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown = CancellationToken::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let current = self.active_connections.load(Ordering::Relaxed);

                            if current >= self.config.listen.max_connections {
                                warn!(
                                    peer = %addr,
                                    active = current,
                                    max = self.config.listen.max_connections,
                                    "connection rejected: limit reached"
                                );
                                self.metrics.record_rejected();
                                continue;
                            }

                            self.active_connections.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %addr, active = current + 1, "accepted connection");

                            let handler = ConnectionHandler::new(
                                Arc::clone(&self.config),
                                Arc::clone(&self.audit),
                                Arc::clone(&self.registry),
                                Arc::clone(&self.metrics),
                                shutdown.child_token(),
                            );
                            let active_connections = Arc::clone(&self.active_connections);

                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(socket, addr).await {
                                    match &e {
                                        ProxyError::Shutdown => {
                                            debug!(peer = %addr, "connection closed: shutdown");
                                        }
                                        ProxyError::Connection(io_err)
                                            if matches!(
                                                io_err.kind(),
                                                std::io::ErrorKind::UnexpectedEof
                                                    | std::io::ErrorKind::ConnectionReset
                                            ) =>
                                        {
                                            debug!(peer = %addr, "client disconnected");
                                        }
                                        ProxyError::IdleTimeout { .. } => {
                                            info!(peer = %addr, error = %e, "connection closed: idle");
                                        }
                                        _ => {
                                            error!(peer = %addr, error = %e, "connection error");
                                        }
                                    }
                                }
                                active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        shutdown.cancel();
        let cancelled = self.registry.cancel_all();
        self.drain(cancelled).await;

        Ok(())
    }

    /// Wait for spawned connection tasks to finish, up to the drain timeout.
    async fn drain(&self, cancelled_pairs: usize) {
        let active = self.active_connections.load(Ordering::Relaxed);
        if active == 0 {
            return;
        }

        let limit = Duration::from_millis(self.config.listen.drain_timeout_ms);
        info!(active, cancelled_pairs, timeout = ?limit, "waiting for connections to close");

        let deadline = Instant::now() + limit;
        while self.active_connections.load(Ordering::Relaxed) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.active_connections.load(Ordering::Relaxed),
                    "drain timeout elapsed with connections still open"
                );
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
        debug!("all connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn test_listener(backend: &str, max_connections: usize) -> ProxyListener {
        let mut config = ProxyConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config.listen.max_connections = max_connections;
        config.listen.drain_timeout_ms = 1000;
        config.backend.address = backend.to_string();
        ProxyListener::new(
            config,
            Arc::new(AuditLogger::new(MemoryAuditSink::new())),
            Arc::new(ProxyMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_bind_uses_ephemeral_port() {
        let listener = test_listener("127.0.0.1:5432", 10);
        let bound = listener.bind().await.unwrap();
        assert_ne!(bound.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_unresolvable_address() {
        let mut config = ProxyConfig::default();
        config.listen.address = "not-a-host.invalid:6432".to_string();
        let listener = ProxyListener::new(
            config,
            Arc::new(AuditLogger::new(MemoryAuditSink::new())),
            Arc::new(ProxyMetrics::new()),
        );
        assert!(listener.bind().await.is_err());
    }

    #[tokio::test]
    async fn test_listener_shutdown() {
        let listener = Arc::new(test_listener("127.0.0.1:5432", 10));
        let bound = listener.bind().await.unwrap();
        let shutdown_handle = listener.shutdown_handle();

        let task = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.serve(bound).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = shutdown_handle.send(());
        let result = timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connection_limit_drops_excess_clients() {
        let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = Arc::new(test_listener(
            &backend.local_addr().unwrap().to_string(),
            1,
        ));
        let bound = listener.bind().await.unwrap();
        let proxy_addr = bound.local_addr().unwrap();
        let shutdown_handle = listener.shutdown_handle();
        let task = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.serve(bound).await })
        };

        let mut first = TcpStream::connect(proxy_addr).await.unwrap();
        first.write_all(b"BEGIN\0").await.unwrap();
        let (_db, _) = backend.accept().await.unwrap();
        while listener.active_connections() == 0 {
            tokio::task::yield_now().await;
        }

        let mut second = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(1), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(listener.metrics.connections_rejected.get(), 1);

        let _ = shutdown_handle.send(());
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(listener.active_connections(), 0);
        assert!(listener.registry().is_empty());
        drop(first);
    }
}
