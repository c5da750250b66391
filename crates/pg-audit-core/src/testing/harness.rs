//! Test harness for integration testing of the audit proxy.
//!
//! Provides a complete test environment with:
//! - Mock backend database
//! - A running proxy on an ephemeral port
//! - An in-memory audit sink to inspect written records

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::audit::{AuditLogger, MemoryAuditSink};
use crate::config::{ProxyConfig, RelayMode};
use crate::metrics::ProxyMetrics;
use crate::network::{ConnectionRegistry, ProxyListener};

use super::mock_backend::{BackendCall, MockBackend, ReplyGenerator};

/// Test harness for integration testing.
pub struct ProxyTestHarness {
    mock_backend: MockBackend,
    proxy_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<crate::error::Result<()>>>,
    /// Audit records written by the proxy.
    pub audit: MemoryAuditSink,
    /// Live pairs of the running proxy.
    pub registry: Arc<ConnectionRegistry>,
    /// Metrics of the running proxy.
    pub metrics: Arc<ProxyMetrics>,
    /// Configuration the proxy was started with.
    pub config: ProxyConfig,
}

impl ProxyTestHarness {
    /// Create a new test harness with default configuration.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Address clients connect to.
    #[must_use]
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Get the mock backend address.
    #[must_use]
    pub fn backend_address(&self) -> &str {
        self.mock_backend.address()
    }

    /// Access the mock backend.
    #[must_use]
    pub fn backend(&self) -> &MockBackend {
        &self.mock_backend
    }

    /// Open a client connection to the proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy does not accept the connection.
    pub async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.proxy_addr).await
    }

    /// Replace the mock backend's reply generator.
    pub async fn set_reply(&self, generator: ReplyGenerator) {
        self.mock_backend.set_reply(generator).await;
    }

    /// Get all chunks received by the mock backend.
    pub async fn get_backend_calls(&self) -> Vec<BackendCall> {
        self.mock_backend.get_calls().await
    }

    /// Audit log contents, one entry per line.
    #[must_use]
    pub fn audit_lines(&self) -> Vec<String> {
        self.audit.lines()
    }

    /// Poll until `condition` holds or `limit` elapses. Returns whether it held.
    pub async fn wait_for<F>(&self, limit: Duration, mut condition: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until no pair is registered.
    pub async fn wait_for_idle(&self, limit: Duration) -> bool {
        self.wait_for(limit, |h| h.registry.is_empty()).await
    }

    /// Stop the mock backend, closing its side of every open pair.
    pub async fn stop_backend(&mut self) {
        self.mock_backend.stop().await;
    }

    /// Shutdown the proxy and the mock backend.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.mock_backend.stop().await;
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    mode: RelayMode,
    idle_timeout: Duration,
    buffer_size: usize,
    max_connections: usize,
    backend_address: Option<String>,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: RelayMode::RequestReply,
            idle_timeout: Duration::from_secs(5),
            buffer_size: 8192,
            max_connections: 100,
            backend_address: None,
        }
    }

    /// Set the relay mode.
    #[must_use]
    pub fn mode(mut self, mode: RelayMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the per-read idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the relay buffer size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the connection limit.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Point the proxy at this address instead of the mock backend.
    #[must_use]
    pub fn backend_address(mut self, address: impl Into<String>) -> Self {
        self.backend_address = Some(address.into());
        self
    }

    /// Build the test harness.
    pub async fn build(self) -> ProxyTestHarness {
        let mut mock_backend = MockBackend::new("127.0.0.1:0");
        let mock_backend_addr = mock_backend
            .start()
            .await
            .expect("Failed to start mock backend");

        let mut config = ProxyConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config.listen.max_connections = self.max_connections;
        config.listen.drain_timeout_ms = 1000;
        config.backend.address = self.backend_address.unwrap_or(mock_backend_addr);
        config.backend.connect_timeout_ms = 2000;
        config.relay.mode = self.mode;
        config.relay.buffer_size = self.buffer_size;
        config.relay.idle_timeout_ms = self.idle_timeout.as_millis() as u64;
        config.validate().expect("invalid harness configuration");

        let audit = MemoryAuditSink::new();
        let metrics = Arc::new(ProxyMetrics::new());
        let logger = AuditLogger::new(audit.clone()).with_metrics(Arc::clone(&metrics));

        let listener = ProxyListener::new(config.clone(), Arc::new(logger), Arc::clone(&metrics));
        let bound = listener.bind().await.expect("Failed to bind proxy");
        let proxy_addr = bound.local_addr().expect("bound listener has an address");
        let shutdown_tx = listener.shutdown_handle();
        let registry = listener.registry();

        let task = tokio::spawn(async move { listener.serve(bound).await });

        ProxyTestHarness {
            mock_backend,
            proxy_addr,
            shutdown_tx,
            task: Some(task),
            audit,
            registry,
            metrics,
            config,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_harness_creation() {
        let mut harness = ProxyTestHarness::new().await;

        assert_ne!(harness.proxy_addr().port(), 0);
        assert!(!harness.backend_address().is_empty());
        assert_eq!(harness.config.relay.mode, RelayMode::RequestReply);
        assert!(harness.registry.is_empty());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_harness_round_trip() {
        let mut harness = TestHarnessBuilder::new()
            .mode(RelayMode::FullDuplex)
            .build()
            .await;

        let mut client = harness.connect().await.unwrap();
        client.write_all(b"DELETE FROM t\0").await.unwrap();
        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"DELETE FROM t\0");

        // Echoed reply is audited too.
        assert_eq!(harness.audit_lines(), vec!["DELETE FROM t", "DELETE FROM t"]);

        drop(client);
        assert!(harness.wait_for_idle(Duration::from_secs(2)).await);
        harness.shutdown().await;
    }
}
