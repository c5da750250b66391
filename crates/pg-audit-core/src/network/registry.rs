//! Registry of live client/backend pairs.
//!
//! The streams of a pair are owned by the task relaying it; the registry
//! holds what the rest of the proxy needs to know about the pair (addresses,
//! age) and a cancellation token so a supervisor can end pairs it does not
//! own. An entry exists exactly while both streams of its pair are open.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opaque identifier of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Numeric value, for structured log fields.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair-{}", self.0)
    }
}

/// What the registry knows about one pair.
#[derive(Debug, Clone)]
pub struct PairInfo {
    /// Pair identifier.
    pub id: ConnectionId,
    /// Client peer address.
    pub client_addr: SocketAddr,
    /// Backend peer address.
    pub backend_addr: SocketAddr,
    /// When the pair was opened.
    pub opened_at: Instant,
    cancel: CancellationToken,
}

impl PairInfo {
    /// Time since the pair was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Whether the pair has been asked to close.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Lock-guarded map from [`ConnectionId`] to [`PairInfo`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    pairs: DashMap<ConnectionId, PairInfo>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected pair.
    ///
    /// Must only be called once the backend connection is established. The
    /// returned guard removes the entry when closed or dropped.
    pub fn open(
        self: &Arc<Self>,
        client_addr: SocketAddr,
        backend_addr: SocketAddr,
    ) -> PairGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let info = PairInfo {
            id,
            client_addr,
            backend_addr,
            opened_at: Instant::now(),
            cancel: CancellationToken::new(),
        };
        let cancel = info.cancel.clone();
        self.pairs.insert(id, info);
        debug!(connection_id = %id, client = %client_addr, backend = %backend_addr, "pair registered");

        PairGuard {
            registry: Arc::clone(self),
            id,
            cancel,
            released: false,
        }
    }

    /// Remove a pair. Returns `None` if it was already removed.
    pub fn remove(&self, id: ConnectionId) -> Option<PairInfo> {
        let removed = self.pairs.remove(&id).map(|(_, info)| info);
        if removed.is_some() {
            debug!(connection_id = %id, "pair removed");
        }
        removed
    }

    /// Snapshot of a pair's entry.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<PairInfo> {
        self.pairs.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether a pair is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.pairs.contains_key(&id)
    }

    /// Number of live pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pair is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Identifiers of all live pairs, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.pairs.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ask a pair to close. Its owning task performs the teardown.
    pub fn cancel(&self, id: ConnectionId) -> bool {
        match self.pairs.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask every live pair to close. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in &self.pairs {
            entry.cancel.cancel();
            count += 1;
        }
        count
    }
}

/// Ownership of one registry entry.
///
/// Removing the entry happens exactly once, either through [`PairGuard::close`]
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct PairGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    cancel: CancellationToken,
    released: bool,
}

impl PairGuard {
    /// Identifier of the guarded pair.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled when a supervisor asks this pair to close.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Remove the entry now and return it.
    pub fn close(mut self) -> Option<PairInfo> {
        self.release()
    }

    fn release(&mut self) -> Option<PairInfo> {
        if self.released {
            return None;
        }
        self.released = true;
        self.registry.remove(self.id)
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:5432".parse().unwrap(),
        )
    }

    #[test]
    fn test_open_assigns_unique_ids() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, backend) = addrs();

        let a = registry.open(client, backend);
        let b = registry.open(client, backend);

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_close_removes_entry_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, backend) = addrs();
        let guard = registry.open(client, backend);
        let id = guard.id();

        let info = guard.close().unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.client_addr, client);
        assert!(!registry.contains(id));
        assert!(registry.get(id).is_none());

        // A second removal is a no-op.
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_removes_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, backend) = addrs();
        let id = {
            let guard = registry.open(client, backend);
            assert!(registry.contains(guard.id()));
            guard.id()
        };
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_external_remove_then_drop_is_idempotent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, backend) = addrs();
        let guard = registry.open(client, backend);
        let other = registry.open(client, backend);

        assert!(registry.remove(guard.id()).is_some());
        drop(guard);

        // The unrelated pair is untouched.
        assert_eq!(registry.ids(), vec![other.id()]);
    }

    #[test]
    fn test_cancel_signals_only_target_pair() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, backend) = addrs();
        let a = registry.open(client, backend);
        let b = registry.open(client, backend);

        assert!(registry.cancel(a.id()));
        assert!(a.cancellation().is_cancelled());
        assert!(!b.cancellation().is_cancelled());
        assert!(registry.get(a.id()).unwrap().is_cancelled());

        assert_eq!(registry.cancel_all(), 2);
        assert!(b.cancellation().is_cancelled());

        let id = a.id();
        drop(a);
        assert!(!registry.cancel(id));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::from(17).to_string(), "pair-17");
        assert_eq!(ConnectionId::from(17).get(), 17);
    }
}
