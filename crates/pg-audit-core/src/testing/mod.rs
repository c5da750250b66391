//! Test utilities for the audit proxy.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBackend`] - A lightweight mock database backend for testing
//! - [`ProxyTestHarness`] - A running proxy wired to a mock backend and an in-memory audit log
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use pg_audit_core::testing::ProxyTestHarness;
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::test]
//! async fn test_select_is_audited() {
//!     let mut harness = ProxyTestHarness::new().await;
//!
//!     let mut client = harness.connect().await.unwrap();
//!     client.write_all(b"SELECT 1\0").await.unwrap();
//!
//!     // ...read the reply, then inspect harness.audit_lines()
//!     harness.shutdown().await;
//! }
//! ```

pub mod harness;
pub mod mock_backend;

pub use harness::{ProxyTestHarness, TestHarnessBuilder};
pub use mock_backend::{BackendCall, MockBackend, ReplyGenerator};
