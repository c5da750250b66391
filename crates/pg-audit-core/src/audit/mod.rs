//! Audit trail of SQL commands seen in relayed traffic.
//!
//! - [`extractor`] finds the leftmost command keyword and trims the span
//! - [`logger`] serializes records into a sink under a shared lock
//! - [`sink`] holds the file and in-memory destinations

pub mod extractor;
pub mod logger;
pub mod sink;

pub use extractor::{CommandExtractor, KEYWORDS};
pub use logger::{AuditLogger, AuditRecord, Direction};
pub use sink::{AuditSink, FileAuditSink, MemoryAuditSink};
