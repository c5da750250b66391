//! Destinations for audit lines.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// An append-only destination for audit lines.
///
/// Callers serialize access; an implementation only has to write one
/// complete line per call.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one line. `line` already carries its trailing newline.
    async fn append(&mut self, line: &[u8]) -> io::Result<()>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Audit file opened once in append mode.
pub struct FileAuditSink {
    path: PathBuf,
    file: File,
}

impl FileAuditSink {
    /// Open (creating if missing) the audit file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, for example when the
    /// parent directory does not exist.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory sink. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Written lines without their newline, lossily decoded.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let contents = self.contents();
        contents
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contents().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&mut self, line: &[u8]) -> io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| io::Error::other("audit buffer poisoned"))?;
        buffer.extend_from_slice(line);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
