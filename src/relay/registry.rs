//! Per-channel connection registry.
//!
//! Every connection lives in at most one of two maps: `pending` while it has
//! not proven liveness, `active` once it receives broadcast traffic. All
//! mutations go through one mutex so the capacity cap cannot be overrun.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::mailbox::Mailbox;
use super::{ChannelKind, CloseReason};

/// Process-unique identifier of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of a promotion attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Promotion {
    /// Moved from pending to active.
    Promoted,
    /// Was already active; only the activity timestamp changed.
    AlreadyActive,
    /// Active set is full; the connection was dropped from pending.
    CapacityExceeded,
    /// Neither pending nor active (expired or removed concurrently).
    Unknown,
}

/// Which map a removed connection was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pending,
    Active,
}

struct PendingEntry {
    admitted_at: Instant,
    closer: oneshot::Sender<CloseReason>,
}

struct ActiveEntry {
    outbound: Mailbox,
    last_activity: Instant,
    closer: oneshot::Sender<CloseReason>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<ConnectionId, PendingEntry>,
    active: HashMap<ConnectionId, ActiveEntry>,
}

/// Pending and active subscribers of one channel.
pub struct Registry {
    kind: ChannelKind,
    max_connections: usize,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(kind: ChannelKind, max_connections: usize) -> Self {
        Self {
            kind,
            max_connections,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admits a freshly accepted connection into `pending`.
    ///
    /// Returns the receiver on which the registry will signal a forced close,
    /// or `CapacityExceeded` when the active set is already full.
    pub fn accept(
        &self,
        id: ConnectionId,
        now: Instant,
    ) -> Result<oneshot::Receiver<CloseReason>, CloseReason> {
        let mut inner = self.lock();
        if inner.active.len() >= self.max_connections {
            tracing::info!(
                channel = %self.kind,
                connection_id = %id,
                active = inner.active.len(),
                "Rejecting connection: capacity exceeded"
            );
            return Err(CloseReason::CapacityExceeded);
        }

        let (closer, closed) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingEntry {
                admitted_at: now,
                closer,
            },
        );
        tracing::debug!(
            channel = %self.kind,
            connection_id = %id,
            pending = inner.pending.len(),
            "Connection pending admission"
        );
        Ok(closed)
    }

    /// Moves a pending connection into the active set.
    ///
    /// Capacity is checked again here: several connections may have been
    /// pending when the set filled up. `outbound` is only consumed when the
    /// connection is actually promoted.
    pub fn promote(
        &self,
        id: ConnectionId,
        outbound: &mut Option<Mailbox>,
        now: Instant,
    ) -> Promotion {
        let mut inner = self.lock();

        if let Some(entry) = inner.active.get_mut(&id) {
            entry.last_activity = now;
            return Promotion::AlreadyActive;
        }

        let Some(pending) = inner.pending.remove(&id) else {
            return Promotion::Unknown;
        };

        if inner.active.len() >= self.max_connections {
            let _ = pending.closer.send(CloseReason::CapacityExceeded);
            tracing::info!(
                channel = %self.kind,
                connection_id = %id,
                "Promotion refused: capacity exceeded"
            );
            return Promotion::CapacityExceeded;
        }

        let Some(tx) = outbound.take() else {
            // Already promoted once and since evicted; never re-admit.
            return Promotion::Unknown;
        };

        inner.active.insert(
            id,
            ActiveEntry {
                outbound: tx,
                last_activity: now,
                closer: pending.closer,
            },
        );
        tracing::info!(
            channel = %self.kind,
            connection_id = %id,
            active = inner.active.len(),
            waited_ms = now.duration_since(pending.admitted_at).as_millis() as u64,
            "Connection admitted"
        );
        Promotion::Promoted
    }

    /// Refreshes the activity timestamp of an active connection.
    pub fn touch(&self, id: ConnectionId, now: Instant) -> bool {
        match self.lock().active.get_mut(&id) {
            Some(entry) => {
                entry.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Removes a connection from whichever map holds it, without signalling.
    pub fn remove(&self, id: ConnectionId) -> Option<Slot> {
        let mut inner = self.lock();
        let slot = if inner.pending.remove(&id).is_some() {
            Some(Slot::Pending)
        } else if inner.active.remove(&id).is_some() {
            Some(Slot::Active)
        } else {
            None
        };
        if slot.is_some() {
            tracing::debug!(
                channel = %self.kind,
                connection_id = %id,
                active = inner.active.len(),
                pending = inner.pending.len(),
                "Connection removed"
            );
        }
        slot
    }

    /// Removes active connections and tells each one why.
    pub fn evict(&self, ids: &[ConnectionId], reason: CloseReason) -> usize {
        let mut inner = self.lock();
        let mut evicted = 0;
        for id in ids {
            if let Some(entry) = inner.active.remove(id) {
                let _ = entry.closer.send(reason);
                evicted += 1;
                tracing::info!(
                    channel = %self.kind,
                    connection_id = %id,
                    %reason,
                    "Subscriber evicted"
                );
            }
        }
        evicted
    }

    /// Closes and removes every pending connection older than `timeout`.
    pub fn expire_pending(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let mut inner = self.lock();
        let expired: Vec<ConnectionId> = inner
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.admitted_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = inner.pending.remove(id) {
                let _ = entry.closer.send(CloseReason::AdmissionTimeout);
            }
        }
        expired
    }

    /// Copies the active set for one broadcast pass.
    pub fn snapshot_active(&self) -> Vec<(ConnectionId, Mailbox)> {
        self.lock()
            .active
            .iter()
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect()
    }

    /// Closes every connection in both maps.
    pub fn close_all(&self, reason: CloseReason) {
        let mut inner = self.lock();
        for (_, entry) in inner.pending.drain() {
            let _ = entry.closer.send(reason);
        }
        for (_, entry) in inner.active.drain() {
            let _ = entry.closer.send(reason);
        }
    }

    pub fn last_activity(&self, id: ConnectionId) -> Option<Instant> {
        self.lock().active.get(&id).map(|entry| entry.last_activity)
    }

    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.lock().active.contains_key(&id)
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.lock().active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::relay::mailbox::{mailbox, Inbox};

    fn outbound() -> (Option<Mailbox>, Inbox) {
        let (tx, rx) = mailbox();
        (Some(tx), rx)
    }

    fn admit(registry: &Registry, now: Instant) -> (ConnectionId, Inbox) {
        let id = ConnectionId::next();
        registry.accept(id, now).unwrap();
        let (mut tx, rx) = outbound();
        assert_eq!(registry.promote(id, &mut tx, now), Promotion::Promoted);
        (id, rx)
    }

    #[test]
    fn test_promotes_exactly_once() {
        let registry = Registry::new(ChannelKind::Video, 2);
        let now = Instant::now();
        let id = ConnectionId::next();

        registry.accept(id, now).unwrap();
        assert!(registry.is_pending(id));

        let (mut tx, _rx) = outbound();
        assert_eq!(registry.promote(id, &mut tx, now), Promotion::Promoted);
        assert!(tx.is_none());
        assert!(registry.is_active(id));
        assert!(!registry.is_pending(id));

        let later = now + Duration::from_secs(3);
        assert_eq!(registry.promote(id, &mut tx, later), Promotion::AlreadyActive);
        assert_eq!(registry.last_activity(id), Some(later));
        assert_eq!(registry.active_len(), 1);
    }

    #[test]
    fn test_capacity_rejects_and_frees() {
        let registry = Registry::new(ChannelKind::Video, 2);
        let now = Instant::now();

        let (first, _a) = admit(&registry, now);
        let (_second, _b) = admit(&registry, now);

        let third = ConnectionId::next();
        assert_eq!(
            registry.accept(third, now).unwrap_err(),
            CloseReason::CapacityExceeded
        );

        assert_eq!(registry.remove(first), Some(Slot::Active));
        let (_fourth, _c) = admit(&registry, now);
        assert_eq!(registry.active_len(), 2);
    }

    #[test]
    fn test_capacity_rechecked_at_promotion() {
        let registry = Registry::new(ChannelKind::Meta, 1);
        let now = Instant::now();

        let early = ConnectionId::next();
        let late = ConnectionId::next();
        registry.accept(early, now).unwrap();
        let mut closed = registry.accept(late, now).unwrap();

        let (mut tx, _rx) = outbound();
        assert_eq!(registry.promote(early, &mut tx, now), Promotion::Promoted);

        let (mut tx2, _rx2) = outbound();
        assert_eq!(
            registry.promote(late, &mut tx2, now),
            Promotion::CapacityExceeded
        );
        assert_eq!(closed.try_recv().unwrap(), CloseReason::CapacityExceeded);
        assert!(!registry.is_pending(late));
        assert_eq!(registry.active_len(), 1);
    }

    #[test]
    fn test_expire_only_touches_old_pending() {
        let registry = Registry::new(ChannelKind::Video, 4);
        let start = Instant::now();
        let timeout = Duration::from_secs(10);

        let stale = ConnectionId::next();
        let mut stale_closed = registry.accept(stale, start).unwrap();
        let (active, _rx) = admit(&registry, start);
        let fresh = ConnectionId::next();
        registry.accept(fresh, start + Duration::from_secs(8)).unwrap();

        let expired = registry.expire_pending(start + Duration::from_secs(11), timeout);
        assert_eq!(expired, vec![stale]);
        assert_eq!(stale_closed.try_recv().unwrap(), CloseReason::AdmissionTimeout);
        assert!(registry.is_pending(fresh));
        assert!(registry.is_active(active));
    }

    #[test]
    fn test_promote_after_expiry_is_unknown() {
        let registry = Registry::new(ChannelKind::Video, 4);
        let start = Instant::now();
        let id = ConnectionId::next();
        registry.accept(id, start).unwrap();
        registry.expire_pending(start + Duration::from_secs(30), Duration::from_secs(10));

        let (mut tx, _rx) = outbound();
        assert_eq!(registry.promote(id, &mut tx, start), Promotion::Unknown);
        assert!(tx.is_some());
    }

    #[test]
    fn test_evict_signals_reason() {
        let registry = Registry::new(ChannelKind::Video, 4);
        let now = Instant::now();
        let id = ConnectionId::next();
        let mut closed = registry.accept(id, now).unwrap();
        let (mut tx, _rx) = outbound();
        registry.promote(id, &mut tx, now);

        assert_eq!(registry.evict(&[id], CloseReason::SendFailed), 1);
        assert_eq!(closed.try_recv().unwrap(), CloseReason::SendFailed);
        assert_eq!(registry.evict(&[id], CloseReason::SendFailed), 0);
        assert_eq!(registry.remove(id), None);
    }
}
