//! Serialized audit logging.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::metrics::ProxyMetrics;

use super::extractor::CommandExtractor;
use super::sink::AuditSink;

/// Which side of a pair produced the bytes being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes sent by the client towards the backend.
    ClientToBackend,
    /// Bytes sent by the backend towards the client.
    BackendToClient,
}

impl Direction {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientToBackend => "client",
            Self::BackendToClient => "backend",
        }
    }

    /// Name of the peer the bytes are written to.
    #[must_use]
    pub fn destination(&self) -> &'static str {
        match self {
            Self::ClientToBackend => "backend",
            Self::BackendToClient => "client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Where the command was observed.
    pub direction: Direction,
    /// Raw command bytes, without terminator or newline.
    pub text: Vec<u8>,
}

/// Extracts commands from relayed bytes and appends them to a sink.
///
/// The sink sits behind one async mutex shared by every pair task, so lines
/// from concurrent pairs never interleave.
pub struct AuditLogger {
    extractor: CommandExtractor,
    sink: Mutex<Box<dyn AuditSink>>,
    description: String,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl AuditLogger {
    /// Create a logger writing to `sink`.
    pub fn new(sink: impl AuditSink + 'static) -> Self {
        let description = sink.describe();
        Self {
            extractor: CommandExtractor::new(),
            sink: Mutex::new(Box::new(sink)),
            description,
            metrics: None,
        }
    }

    /// Count records and write failures in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Description of the sink (file path or "memory").
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.description
    }

    /// Extract a command from `bytes` and append it, if there is one.
    ///
    /// A failed append is logged and counted but not returned: losing an
    /// audit line never tears down the connection it came from.
    pub async fn observe(
        &self,
        connection_id: u64,
        direction: Direction,
        bytes: &[u8],
    ) -> Option<AuditRecord> {
        let text = self.extractor.extract(bytes)?;

        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text);
        line.push(b'\n');

        let result = {
            let mut sink = self.sink.lock().await;
            sink.append(&line).await
        };

        match result {
            Ok(()) => {
                debug!(
                    target: "pg_audit::audit",
                    connection_id,
                    direction = %direction,
                    len = text.len(),
                    command = %String::from_utf8_lossy(text),
                    "command recorded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_audit(direction.as_str());
                }
            }
            Err(e) => {
                error!(
                    target: "pg_audit::audit",
                    connection_id,
                    direction = %direction,
                    sink = %self.description,
                    error = %e,
                    "failed to append audit record"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_audit_error();
                }
            }
        }

        Some(AuditRecord {
            direction,
            text: text.to_vec(),
        })
    }
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sink", &self.description)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::audit::MemoryAuditSink;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&mut self, _line: &[u8]) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[tokio::test]
    async fn test_observe_writes_trimmed_line() {
        let sink = MemoryAuditSink::new();
        let logger = AuditLogger::new(sink.clone());

        let record = logger
            .observe(1, Direction::ClientToBackend, b"SELECT * FROM users\0xyz")
            .await
            .unwrap();

        assert_eq!(record.text, b"SELECT * FROM users");
        assert_eq!(record.direction, Direction::ClientToBackend);
        assert_eq!(sink.contents(), b"SELECT * FROM users\n");
    }

    #[tokio::test]
    async fn test_observe_without_keyword_leaves_sink_untouched() {
        let sink = MemoryAuditSink::new();
        let logger = AuditLogger::new(sink.clone());

        assert!(logger
            .observe(1, Direction::ClientToBackend, b"hello world")
            .await
            .is_none());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_is_counted_not_returned() {
        let metrics = Arc::new(ProxyMetrics::new());
        let logger = AuditLogger::new(FailingSink).with_metrics(Arc::clone(&metrics));

        let record = logger
            .observe(7, Direction::BackendToClient, b"COMMIT\0")
            .await;

        assert!(record.is_some());
        assert_eq!(metrics.audit_write_errors.get(), 1.0);
        assert_eq!(logger.destination(), "failing");
    }

    #[tokio::test]
    async fn test_concurrent_observers_do_not_interleave() {
        let sink = MemoryAuditSink::new();
        let logger = Arc::new(AuditLogger::new(sink.clone()));

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let logger = Arc::clone(&logger);
            tasks.push(tokio::spawn(async move {
                let payload = format!("INSERT INTO t VALUES ({i})\0");
                logger
                    .observe(i, Direction::ClientToBackend, payload.as_bytes())
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut lines = sink.lines();
        lines.sort();
        let mut expected: Vec<String> = (0..16)
            .map(|i| format!("INSERT INTO t VALUES ({i})"))
            .collect();
        expected.sort();
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::ClientToBackend.to_string(), "client");
        assert_eq!(Direction::BackendToClient.destination(), "client");
    }
}
