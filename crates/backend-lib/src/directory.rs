// ============================
// crates/backend-lib/src/directory.rs
// ============================
//! Identity directory: which live connection answers for which identity.
//!
//! The forward map (identity → handle) and the reverse index
//! (connection id → identity) live behind one lock so they never disagree.
//! Writers (`bind`, `unbind`) are exclusive; `lookup`s share the read side.
//! The lock is only held for the map operation itself, never across an await.
use crate::connection::{ConnectionHandle, ConnectionId};
use chat_relay_common::UserId;
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Entries {
    by_identity: HashMap<UserId, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, UserId>,
}

/// Identity → most recently bound connection
#[derive(Default)]
pub struct IdentityDirectory {
    entries: RwLock<Entries>,
}

impl IdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `identity`, replacing any earlier handle.
    ///
    /// The replaced handle is returned but not closed; its connection keeps
    /// running until its own transport goes away.
    pub fn bind(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let id = handle.id();
        let mut entries = self.entries.write();

        // A handle answers for one identity at a time
        if let Some(old_identity) = entries.by_connection.remove(&id) {
            if old_identity != identity {
                entries.by_identity.remove(&old_identity);
            }
        }

        entries.by_connection.insert(id, identity.to_string());
        let previous = entries.by_identity.insert(identity.to_string(), handle);
        if let Some(prev) = &previous {
            if prev.id() != id {
                entries.by_connection.remove(&prev.id());
            }
        }

        gauge!(crate::metrics::DIRECTORY_BOUND).set(entries.by_identity.len() as f64);
        previous
    }

    /// Remove the entry owned by `handle`, if any, returning its identity.
    ///
    /// Unknown handles and handles already replaced by a newer bind are
    /// no-ops.
    pub fn unbind(&self, handle: &ConnectionHandle) -> Option<UserId> {
        let mut entries = self.entries.write();
        let identity = entries.by_connection.remove(&handle.id())?;

        let owns_entry = entries
            .by_identity
            .get(&identity)
            .is_some_and(|current| current.id() == handle.id());
        if !owns_entry {
            return None;
        }
        entries.by_identity.remove(&identity);

        gauge!(crate::metrics::DIRECTORY_BOUND).set(entries.by_identity.len() as f64);
        Some(identity)
    }

    /// Live handle for `identity`, or `None` when the identity is offline
    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.entries.read().by_identity.get(identity).cloned()
    }

    /// Identity currently bound to `connection`, if it still owns an entry
    pub fn identity_of(&self, connection: ConnectionId) -> Option<UserId> {
        self.entries.read().by_connection.get(&connection).cloned()
    }

    /// Number of online identities
    pub fn len(&self) -> usize {
        self.entries.read().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_bind_and_lookup() {
        let directory = IdentityDirectory::new();
        let (handle, _rx) = ConnectionHandle::channel(1);

        assert!(directory.lookup("alice").is_none());
        assert!(directory.bind("alice", handle.clone()).is_none());
        assert_eq!(directory.lookup("alice"), Some(handle.clone()));
        assert_eq!(directory.identity_of(handle.id()).as_deref(), Some("alice"));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_rebind_keeps_only_latest_handle() {
        let directory = IdentityDirectory::new();
        let (first, _rx1) = ConnectionHandle::channel(1);
        let (second, _rx2) = ConnectionHandle::channel(1);

        directory.bind("alice", first.clone());
        let replaced = directory.bind("alice", second.clone());

        assert_eq!(replaced, Some(first.clone()));
        assert_eq!(directory.lookup("alice"), Some(second.clone()));
        assert!(directory.identity_of(first.id()).is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_stale_unbind_does_not_remove_newer_entry() {
        let directory = IdentityDirectory::new();
        let (first, _rx1) = ConnectionHandle::channel(1);
        let (second, _rx2) = ConnectionHandle::channel(1);

        directory.bind("alice", first.clone());
        directory.bind("alice", second.clone());

        assert!(directory.unbind(&first).is_none());
        assert_eq!(directory.lookup("alice"), Some(second.clone()));

        assert_eq!(directory.unbind(&second).as_deref(), Some("alice"));
        assert!(directory.lookup("alice").is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_unbind_unknown_handle_is_noop() {
        let directory = IdentityDirectory::new();
        let (bound, _rx1) = ConnectionHandle::channel(1);
        let (stranger, _rx2) = ConnectionHandle::channel(1);
        directory.bind("bob", bound.clone());

        assert!(directory.unbind(&stranger).is_none());
        assert!(directory.unbind(&stranger).is_none());
        assert_eq!(directory.lookup("bob"), Some(bound.clone()));

        assert!(directory.unbind(&bound).is_some());
        assert!(directory.unbind(&bound).is_none());
    }

    #[test]
    fn test_rebinding_handle_to_new_identity_drops_old_entry() {
        let directory = IdentityDirectory::new();
        let (handle, _rx) = ConnectionHandle::channel(1);

        directory.bind("guest-1", handle.clone());
        directory.bind("carol", handle.clone());

        assert!(directory.lookup("guest-1").is_none());
        assert_eq!(directory.lookup("carol"), Some(handle.clone()));
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_disconnect_leaves_consistent_state() {
        let directory = Arc::new(IdentityDirectory::new());
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..64 {
            let directory = directory.clone();
            tasks.spawn(async move {
                let identity = format!("user-{}", i % 8);
                let (handle, rx) = ConnectionHandle::channel(1);
                directory.bind(&identity, handle.clone());
                tokio::task::yield_now().await;
                directory.unbind(&handle);
                drop(rx);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        // Every connection unbound itself; nothing may survive
        assert!(directory.is_empty());
        for i in 0..8 {
            assert!(directory.lookup(&format!("user-{i}")).is_none());
        }
    }
}
