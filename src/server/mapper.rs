//! Correlation of in-flight requests with their originators.
//!
//! When a request's `Start` frame is routed, the server records which
//! connection sent it, which peer it went to, and how long the entry may
//! live. The first frame of the response resolves (and removes) the entry,
//! so a response is delivered at most once.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::Connection;

#[derive(Debug)]
struct PendingRequest {
    originator: Connection,
    target: Uuid,
    deadline: Instant,
}

/// Pending-request map, shared by all router tasks of one server.
#[derive(Debug, Default)]
pub struct CorrelationMapper {
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl CorrelationMapper {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a routed request. Returns `false` if the id is already pending.
    pub fn set_pending(&self, request_id: Uuid, originator: Connection, target: Uuid, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains_key(&request_id) {
            return false;
        }
        pending.insert(
            request_id,
            PendingRequest {
                originator,
                target,
                deadline,
            },
        );
        true
    }

    /// Remove and return the originator of a request.
    ///
    /// Expired entries are removed but resolve to `None`.
    pub fn resolve(&self, request_id: Uuid) -> Option<Connection> {
        let entry = self.pending.lock().remove(&request_id)?;
        if entry.deadline <= Instant::now() {
            tracing::debug!("Request {} resolved after its deadline", request_id);
            return None;
        }
        Some(entry.originator)
    }

    /// Forget a request without resolving it.
    pub fn cancel(&self, request_id: Uuid) {
        self.pending.lock().remove(&request_id);
    }

    /// Remove every request routed to `target`, returning their originators.
    pub fn drain_target(&self, target: Uuid) -> Vec<(Uuid, Connection)> {
        let mut pending = self.pending.lock();
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, entry)| entry.target == target)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|entry| (id, entry.originator)))
            .collect()
    }

    /// Drop expired entries and entries whose originator has closed.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.deadline > now && !entry.originator.is_closed());
        before - pending.len()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use std::time::Duration;
    use tokio::io::{duplex, split};

    fn connection() -> Connection {
        let (local, remote) = duplex(1024);
        std::mem::forget(remote);
        let (reader, writer) = split(local);
        Connection::new(reader, writer, &ConnectionConfig::default()).0
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_resolve_at_most_once() {
        let mapper = CorrelationMapper::new();
        let origin = connection();
        let id = Uuid::new_v4();

        assert!(mapper.set_pending(id, origin.clone(), Uuid::new_v4(), later()));
        let resolved = mapper.resolve(id).unwrap();
        assert!(resolved.same_as(&origin));
        assert!(mapper.resolve(id).is_none());
        assert!(mapper.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let mapper = CorrelationMapper::new();
        let id = Uuid::new_v4();

        assert!(mapper.set_pending(id, connection(), Uuid::new_v4(), later()));
        assert!(!mapper.set_pending(id, connection(), Uuid::new_v4(), later()));
        assert_eq!(mapper.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_does_not_resolve() {
        let mapper = CorrelationMapper::new();
        let id = Uuid::new_v4();
        mapper.set_pending(id, connection(), Uuid::new_v4(), Instant::now());

        assert!(mapper.resolve(id).is_none());
        assert!(mapper.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_orphaned() {
        let mapper = CorrelationMapper::new();
        let expired = Uuid::new_v4();
        let orphaned = Uuid::new_v4();
        let live = Uuid::new_v4();
        let closed = connection();
        closed.close();

        mapper.set_pending(expired, connection(), Uuid::new_v4(), Instant::now());
        mapper.set_pending(orphaned, closed, Uuid::new_v4(), later());
        mapper.set_pending(live, connection(), Uuid::new_v4(), later());

        assert_eq!(mapper.sweep(Instant::now()), 2);
        assert_eq!(mapper.len(), 1);
        assert!(mapper.resolve(live).is_some());
    }

    #[tokio::test]
    async fn test_drain_target() {
        let mapper = CorrelationMapper::new();
        let provider = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let elsewhere = Uuid::new_v4();

        mapper.set_pending(first, connection(), provider, later());
        mapper.set_pending(second, connection(), provider, later());
        mapper.set_pending(elsewhere, connection(), Uuid::new_v4(), later());

        let mut drained: Vec<_> = mapper.drain_target(provider).into_iter().map(|(id, _)| id).collect();
        drained.sort();
        let mut expected = vec![first, second];
        expected.sort();

        assert_eq!(drained, expected);
        assert_eq!(mapper.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let mapper = CorrelationMapper::new();
        let id = Uuid::new_v4();
        mapper.set_pending(id, connection(), Uuid::new_v4(), later());

        mapper.cancel(id);
        assert!(mapper.is_empty());
    }
}
