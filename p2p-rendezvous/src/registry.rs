//! In-memory nickname registry owned by the rendezvous server.
//!
//! Every read and write goes through a single `Mutex`, held only for the
//! duration of one map operation. Callers never perform network I/O while the
//! guard is alive, so the lock is never contended for longer than a lookup.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::error::{Error, Result};

/// Identifies the session that currently holds a nickname.
pub type SessionId = u64;

/// Where a registered peer can be reached directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub nickname: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(nickname: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            nickname: nickname.into(),
            ip,
            port,
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: PeerRecord,
    owner: Option<SessionId>,
}

/// Thread-safe mapping from nickname to [`PeerRecord`].
///
/// Uses a `BTreeMap` so `list` returns nicknames in a deterministic (sorted)
/// order. Registrations are last-write-wins: a second `register` for the same
/// nickname silently replaces the first.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<String, Entry>>,
    next_session: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a fresh id for a newly accepted session.
    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Inserts or replaces the record for `nickname` without tying it to a
    /// session. Returns the record it displaced, if any.
    pub fn register(&self, nickname: &str, ip: IpAddr, port: u16) -> Option<PeerRecord> {
        self.entries()
            .insert(
                nickname.to_string(),
                Entry {
                    record: PeerRecord::new(nickname, ip, port),
                    owner: None,
                },
            )
            .map(|entry| entry.record)
    }

    /// Registers `record` on behalf of session `owner`.
    ///
    /// When the session previously held a different nickname, that nickname is
    /// released in the same critical section, so no reader ever observes the
    /// session under both names or under neither.
    pub fn claim(
        &self,
        owner: SessionId,
        previous: Option<&str>,
        record: PeerRecord,
    ) -> Option<PeerRecord> {
        let mut entries = self.entries();

        if let Some(previous) = previous.filter(|previous| *previous != record.nickname) {
            if entries.get(previous).is_some_and(|entry| entry.owner == Some(owner)) {
                entries.remove(previous);
            }
        }

        entries
            .insert(
                record.nickname.clone(),
                Entry {
                    record,
                    owner: Some(owner),
                },
            )
            .map(|entry| entry.record)
    }

    /// Returns the current record for `nickname`.
    pub fn lookup(&self, nickname: &str) -> Result<PeerRecord> {
        self.entries()
            .get(nickname)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| Error::PeerNotFound(nickname.to_string()))
    }

    /// Snapshot of every registered nickname at call time.
    pub fn list(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Deletes `nickname` regardless of which session holds it. Idempotent.
    pub fn remove(&self, nickname: &str) -> Option<PeerRecord> {
        self.entries().remove(nickname).map(|entry| entry.record)
    }

    /// Deletes `nickname` only if `owner` still holds it.
    ///
    /// A nickname re-registered by another connection has changed hands; the
    /// earlier holder disconnecting must leave the newer record in place.
    pub fn release(&self, owner: SessionId, nickname: &str) -> bool {
        let mut entries = self.entries();
        if entries.get(nickname).is_some_and(|entry| entry.owner == Some(owner)) {
            entries.remove(nickname);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        // Every mutation is a single map call, so a panic elsewhere cannot leave
        // the map half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc, thread};

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn list_returns_exactly_the_registered_set() {
        let registry = Registry::new();
        for name in ["carol", "alice", "bob"] {
            registry.register(name, ip(1), 5000);
        }

        assert_eq!(registry.list(), vec!["alice", "bob", "carol"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn reregistering_replaces_the_address() {
        let registry = Registry::new();
        registry.register("alice", ip(1), 5000);
        let displaced = registry.register("alice", ip(2), 6000);

        assert_eq!(displaced, Some(PeerRecord::new("alice", ip(1), 5000)));
        assert_eq!(
            registry.lookup("alice").expect("alice registered"),
            PeerRecord::new("alice", ip(2), 6000)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_of_unknown_or_removed_nickname_is_not_found() {
        let registry = Registry::new();
        assert!(matches!(registry.lookup("bob"), Err(Error::PeerNotFound(name)) if name == "bob"));

        registry.register("bob", ip(3), 7000);
        assert!(registry.remove("bob").is_some());
        assert!(registry.remove("bob").is_none());
        assert!(matches!(registry.lookup("bob"), Err(Error::PeerNotFound(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn claim_releases_the_previous_nickname_of_the_same_session() {
        let registry = Registry::new();
        let session = registry.next_session_id();

        registry.claim(session, None, PeerRecord::new("alice", ip(1), 5000));
        registry.claim(session, Some("alice"), PeerRecord::new("alicia", ip(1), 5001));

        assert_eq!(registry.list(), vec!["alicia"]);
    }

    #[test]
    fn claim_does_not_release_a_nickname_taken_over_by_another_session() {
        let registry = Registry::new();
        let first = registry.next_session_id();
        let second = registry.next_session_id();

        registry.claim(first, None, PeerRecord::new("alice", ip(1), 5000));
        registry.claim(second, None, PeerRecord::new("alice", ip(2), 5000));
        registry.claim(first, Some("alice"), PeerRecord::new("al", ip(1), 5000));

        assert_eq!(registry.list(), vec!["al", "alice"]);
        assert_eq!(registry.lookup("alice").expect("alice").ip, ip(2));
    }

    #[test]
    fn release_only_removes_records_owned_by_the_session() {
        let registry = Registry::new();
        let first = registry.next_session_id();
        let second = registry.next_session_id();
        assert_ne!(first, second);

        registry.claim(first, None, PeerRecord::new("alice", ip(1), 5000));
        registry.claim(second, None, PeerRecord::new("alice", ip(2), 5000));

        assert!(!registry.release(first, "alice"));
        assert_eq!(registry.lookup("alice").expect("alice").ip, ip(2));
        assert!(registry.release(second, "alice"));
        assert!(registry.lookup("alice").is_err());
    }

    #[test]
    fn concurrent_registrations_are_all_visible() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..16u8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let nickname = format!("peer{n:02}");
                    for port in 1..=50 {
                        registry.register(&nickname, ip(n), port);
                        let record = registry.lookup(&nickname).expect("own record visible");
                        assert_eq!(record.ip, ip(n));
                        let _ = registry.list();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        let names = registry.list();
        assert_eq!(names.len(), 16);
        for n in 0..16u8 {
            let record = registry.lookup(&format!("peer{n:02}")).expect("registered");
            assert_eq!(record.port, 50);
        }
    }
}
