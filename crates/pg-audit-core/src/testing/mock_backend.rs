//! Mock backend database for integration testing.
//!
//! A lightweight mock backend that:
//! - Accepts plain TCP connections
//! - Records every chunk it receives
//! - Answers each chunk through a configurable reply generator
//! - Can push unsolicited bytes to every open connection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

/// A chunk received by the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    /// Sequence number of the connection that sent it, starting at 1.
    pub connection: usize,
    /// The raw bytes as read from the socket.
    pub bytes: Bytes,
}

/// Reply generator function type. `None` means stay silent.
pub type ReplyGenerator = Arc<dyn Fn(&BackendCall) -> Option<Bytes> + Send + Sync>;

/// Echo every chunk back.
#[must_use]
pub fn echo() -> ReplyGenerator {
    Arc::new(|call: &BackendCall| Some(call.bytes.clone()))
}

/// Never reply.
#[must_use]
pub fn silent() -> ReplyGenerator {
    Arc::new(|_: &BackendCall| None)
}

/// Always reply with the same bytes.
#[must_use]
pub fn fixed(reply: &'static [u8]) -> ReplyGenerator {
    Arc::new(move |_: &BackendCall| Some(Bytes::from_static(reply)))
}

/// Mock backend for testing.
pub struct MockBackend {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    push_tx: broadcast::Sender<Bytes>,
    call_log: Arc<RwLock<Vec<BackendCall>>>,
    reply: Arc<RwLock<ReplyGenerator>>,
    connections: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a new mock backend that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        let (push_tx, _) = broadcast::channel(16);
        Self {
            address: address.into(),
            shutdown_tx: None,
            push_tx,
            call_log: Arc::new(RwLock::new(Vec::new())),
            reply: Arc::new(RwLock::new(echo())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start the mock backend.
    ///
    /// Returns the actual address the backend is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address.clone_from(&actual_address);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = self.call_log.clone();
        let reply = self.reply.clone();
        let connections = self.connections.clone();
        let push_tx = self.push_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let connection = connections.fetch_add(1, Ordering::SeqCst) + 1;
                                let call_log = call_log.clone();
                                let reply = reply.clone();
                                let push_rx = push_tx.subscribe();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_connection(
                                        stream, connection, call_log, reply, push_rx, shutdown_rx,
                                    )
                                    .await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock backend. Open connections are closed.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Replace the reply generator.
    pub async fn set_reply(&self, generator: ReplyGenerator) {
        *self.reply.write().await = generator;
    }

    /// Send bytes to every open connection without a preceding request.
    ///
    /// Returns the number of connections that will receive them.
    pub fn push(&self, bytes: Bytes) -> usize {
        self.push_tx.send(bytes).unwrap_or(0)
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BackendCall> {
        self.call_log.read().await.clone()
    }

    /// All received bytes, concatenated in arrival order.
    pub async fn received(&self) -> Vec<u8> {
        self.call_log
            .read()
            .await
            .iter()
            .flat_map(|call| call.bytes.iter().copied())
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Get the backend address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Handle a single proxy connection.
    async fn handle_connection(
        mut stream: TcpStream,
        connection: usize,
        call_log: Arc<RwLock<Vec<BackendCall>>>,
        reply: Arc<RwLock<ReplyGenerator>>,
        mut push_rx: broadcast::Receiver<Bytes>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                pushed = push_rx.recv() => {
                    match pushed {
                        Ok(bytes) => {
                            if Self::write_chunk(&mut stream, &bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let call = BackendCall {
                                connection,
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                            };
                            call_log.write().await.push(call.clone());

                            let response = {
                                let generator = reply.read().await;
                                generator(&call)
                            };

                            if let Some(response) = response {
                                if Self::write_chunk(&mut stream, &response).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
        stream.write_all(data).await?;
        stream.flush().await
    }
}
