//! Network layer of the audit proxy.
//!
//! This module provides:
//! - TCP listener for accepting client connections
//! - Backend connector for the upstream database
//! - Connection registry tracking live client/backend pairs
//! - Relay loop copying and auditing traffic between the two sides
//! - Connection handler driving one pair from accept to teardown

pub mod backend;
pub mod connection;
pub mod listener;
pub mod registry;
pub mod relay;

pub use backend::BackendConnector;
pub use connection::ConnectionHandler;
pub use listener::ProxyListener;
pub use registry::{ConnectionId, ConnectionRegistry, PairGuard, PairInfo};
pub use relay::{read_some, send_all, PairEnd, Relay};
