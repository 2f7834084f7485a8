//! Process-wide device-id -> session handle map for peer ("friend")
//! message relay (§4.5). The only cross-session shared mutable state in
//! the gateway (§5); a single `DashMap` gives per-key locking instead of
//! one coarse mutex around the whole table.
//!
//! Handles are weak in the sense that matters here: the registry never
//! keeps a session alive, it only holds a cheap `mpsc::Sender` that the
//! session's writer task already owns a clone of. When the session ends
//! it calls [`PeerRegistry::revoke`] itself; there is no cyclic ownership
//! to untangle (§9).

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::protocol::ServerEnvelope;

/// Outcome of attempting to deliver to a peer, mirroring the
/// `friend_ack` status values in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    Full,
    Closed,
}

/// Non-blocking send handle into a session's outbound queue. The
/// registry only ever calls `offer`, never awaits a session directly.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<ServerEnvelope>,
}

impl PeerHandle {
    pub fn new(tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self { tx }
    }

    /// Best-effort, at-most-once, no persistence (§4.5): a full queue or
    /// a closed session is reported back to the caller, never blocked on.
    pub fn offer(&self, envelope: ServerEnvelope) -> OfferOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => OfferOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => OfferOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::Closed,
        }
    }
}

/// Process-wide device-id -> handle map.
#[derive(Default)]
pub struct PeerRegistry {
    by_device_id: DashMap<String, PeerHandle>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session's handle under its device-id. Insertion must
    /// precede the handshake ack so a peer message arriving immediately
    /// after another device connects can still find it (§3 invariant).
    pub fn publish(&self, device_id: &str, handle: PeerHandle) {
        debug!(device_id, "publishing session to peer registry");
        self.by_device_id.insert(device_id.to_string(), handle);
    }

    /// Removes a session's handle. Must precede the session's close
    /// notification, per the same ordering invariant as `publish`.
    pub fn revoke(&self, device_id: &str) {
        if self.by_device_id.remove(device_id).is_some() {
            debug!(device_id, "revoked session from peer registry");
        }
    }

    pub fn lookup(&self, device_id: &str) -> Option<PeerHandle> {
        self.by_device_id.get(device_id).map(|entry| entry.value().clone())
    }

    /// Delivers `envelope` to `device_id` if present, returning the
    /// outcome the caller turns into a `friend_ack`.
    pub fn deliver(&self, device_id: &str, envelope: ServerEnvelope) -> OfferOutcome {
        match self.lookup(device_id) {
            None => {
                let err = PeerError::Unknown(device_id.to_string());
                debug!(device_id, error = %err, "friend message target not connected");
                OfferOutcome::Closed
            }
            Some(handle) => {
                let outcome = handle.offer(envelope);
                if outcome == OfferOutcome::Full {
                    let err = PeerError::Dropped(device_id.to_string());
                    warn!(device_id, error = %err, "peer queue full, message dropped");
                }
                outcome
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_device_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> ServerEnvelope {
        ServerEnvelope::Error { code: "x".to_string(), message: "y".to_string() }
    }

    #[tokio::test]
    async fn lookup_miss_reports_unknown_target() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.deliver("ghost", envelope()), OfferOutcome::Closed);
    }

    #[tokio::test]
    async fn publish_then_lookup_finds_handle() {
        let registry = PeerRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.publish("dev-a", PeerHandle::new(tx));

        assert_eq!(registry.deliver("dev-a", envelope()), OfferOutcome::Accepted);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn revoke_removes_handle() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.publish("dev-a", PeerHandle::new(tx));
        registry.revoke("dev-a");
        assert_eq!(registry.deliver("dev-a", envelope()), OfferOutcome::Closed);
    }

    #[tokio::test]
    async fn full_queue_reports_full_not_blocking() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.publish("dev-a", PeerHandle::new(tx));
        assert_eq!(registry.deliver("dev-a", envelope()), OfferOutcome::Accepted);
        assert_eq!(registry.deliver("dev-a", envelope()), OfferOutcome::Full);
    }
}
