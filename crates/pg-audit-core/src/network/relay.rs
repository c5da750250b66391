//! Byte relay between the two sides of a connection pair.
//!
//! Every chunk is audited before it is forwarded, and forwarding uses a
//! send-until-complete loop so a peer that accepts partial writes still
//! receives every byte.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::audit::{AuditLogger, Direction};
use crate::config::RelayMode;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;

use super::registry::ConnectionId;

/// Which side ended a pair normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairEnd {
    /// The client closed its side.
    ClientClosed,
    /// The backend closed its side.
    BackendClosed,
}

impl PairEnd {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::BackendClosed => "backend_closed",
        }
    }

    fn from_reader(direction: Direction) -> Self {
        match direction {
            Direction::ClientToBackend => Self::ClientClosed,
            Direction::BackendToClient => Self::BackendClosed,
        }
    }
}

/// Read once into `buf`, waiting at most `idle_timeout`.
///
/// Returns the number of bytes read; zero means end of stream.
///
/// # Errors
///
/// Returns [`ProxyError::IdleTimeout`] when the wait elapses and
/// [`ProxyError::Connection`] on a read error.
pub async fn read_some<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
    peer: &'static str,
) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match idle_timeout {
        Some(limit) => match timeout(limit, reader.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::IdleTimeout {
                peer,
                timeout: limit,
            }),
        },
        None => Ok(reader.read(buf).await?),
    }
}

/// Write all of `data`, retrying after partial writes.
///
/// Stops at the first failed write instead of retrying it; a write that
/// accepts zero bytes counts as failed.
///
/// # Errors
///
/// Returns [`ProxyError::SendFailed`] with the number of bytes that made it
/// out before the failure.
pub async fn send_all<W>(writer: &mut W, data: &[u8], peer: &'static str) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = data.len();
    let mut sent = 0;

    while sent < total {
        match writer.write(&data[sent..]).await {
            Ok(0) => {
                return Err(ProxyError::SendFailed {
                    peer,
                    sent,
                    total,
                    source: std::io::Error::new(ErrorKind::WriteZero, "peer accepted no bytes"),
                });
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ProxyError::SendFailed {
                    peer,
                    sent,
                    total,
                    source,
                });
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|source| ProxyError::SendFailed {
            peer,
            sent,
            total,
            source,
        })?;

    Ok(sent)
}

/// Last time any byte moved through a pair, in either direction.
#[derive(Debug)]
struct PairActivity {
    started: Instant,
    last_ms: AtomicU64,
}

impl PairActivity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Drives the relay for one pair.
pub struct Relay<'a> {
    connection_id: ConnectionId,
    audit: &'a AuditLogger,
    metrics: Option<&'a ProxyMetrics>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    activity: PairActivity,
}

impl<'a> Relay<'a> {
    /// Create a relay for `connection_id`.
    #[must_use]
    pub fn new(connection_id: ConnectionId, audit: &'a AuditLogger, buffer_size: usize) -> Self {
        Self {
            connection_id,
            audit,
            metrics: None,
            buffer_size,
            idle_timeout: None,
            activity: PairActivity::new(),
        }
    }

    /// Count relayed bytes in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: &'a ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// End the pair once no bytes moved in either direction for `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Run the relay until one side closes or fails.
    ///
    /// `initial` holds client bytes consumed before the relay started; they
    /// are forwarded as the first client chunk.
    ///
    /// # Errors
    ///
    /// Returns the first I/O, send or timeout error on either side.
    pub async fn run<C, B>(
        &self,
        mode: RelayMode,
        client: &mut C,
        backend: &mut B,
        initial: Option<Bytes>,
    ) -> Result<PairEnd>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        match mode {
            RelayMode::RequestReply => self.request_reply(client, backend, initial).await,
            RelayMode::FullDuplex => self.full_duplex(client, backend, initial).await,
        }
    }

    /// Audit a chunk and forward it to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SendFailed`] if the chunk cannot be delivered.
    pub async fn forward<W>(&self, direction: Direction, chunk: &[u8], dst: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.audit
            .observe(self.connection_id.get(), direction, chunk)
            .await;

        let sent = send_all(dst, chunk, direction.destination()).await?;
        self.activity.touch();
        trace!(
            connection_id = %self.connection_id,
            direction = %direction,
            bytes = sent,
            "chunk forwarded"
        );
        if let Some(metrics) = self.metrics {
            metrics.record_bytes(direction.as_str(), sent as u64);
        }
        Ok(())
    }

    /// Read once from `reader`, timing out only when the whole pair was idle.
    ///
    /// Traffic in the other direction pushes the deadline out, so a silent
    /// client stays connected while the backend keeps streaming.
    async fn read_active<R>(
        &self,
        reader: &mut R,
        buf: &mut [u8],
        peer: &'static str,
    ) -> Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let Some(limit) = self.idle_timeout else {
            return Ok(reader.read(buf).await?);
        };

        loop {
            let remaining = limit.saturating_sub(self.activity.idle_for());
            if remaining.is_zero() {
                return Err(ProxyError::IdleTimeout {
                    peer,
                    timeout: limit,
                });
            }
            if let Ok(result) = timeout(remaining, reader.read(buf)).await {
                let n = result?;
                self.activity.touch();
                return Ok(n);
            }
        }
    }

    /// One client read, forwarded, then one backend read relayed back.
    async fn request_reply<C, B>(
        &self,
        client: &mut C,
        backend: &mut B,
        initial: Option<Bytes>,
    ) -> Result<PairEnd>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = vec![0u8; self.buffer_size];
        let mut reply = vec![0u8; self.buffer_size];
        let mut pending = initial;

        loop {
            match pending.take() {
                Some(chunk) => {
                    self.forward(Direction::ClientToBackend, &chunk, backend)
                        .await?;
                }
                None => {
                    let n = self.read_active(client, &mut request, "client").await?;
                    if n == 0 {
                        return Ok(PairEnd::ClientClosed);
                    }
                    self.forward(Direction::ClientToBackend, &request[..n], backend)
                        .await?;
                }
            }

            let n = self.read_active(backend, &mut reply, "backend").await?;
            if n == 0 {
                return Ok(PairEnd::BackendClosed);
            }
            self.forward(Direction::BackendToClient, &reply[..n], client)
                .await?;
        }
    }

    /// Both directions copied independently; the first to finish ends the pair.
    async fn full_duplex<C, B>(
        &self,
        client: &mut C,
        backend: &mut B,
        initial: Option<Bytes>,
    ) -> Result<PairEnd>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(chunk) = initial {
            self.forward(Direction::ClientToBackend, &chunk, backend)
                .await?;
        }

        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (mut backend_rx, mut backend_tx) = tokio::io::split(backend);

        tokio::select! {
            result = self.pump(Direction::ClientToBackend, &mut client_rx, &mut backend_tx) => result,
            result = self.pump(Direction::BackendToClient, &mut backend_rx, &mut client_tx) => result,
        }
    }

    async fn pump<R, W>(&self, direction: Direction, src: &mut R, dst: &mut W) -> Result<PairEnd>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = self.read_active(src, &mut buf, direction.as_str()).await?;
            if n == 0 {
                return Ok(PairEnd::from_reader(direction));
            }
            self.forward(direction, &buf[..n], dst).await?;
        }
    }
}
