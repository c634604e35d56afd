//! Store-and-forward relay logic
//!
//! [`RelayCore`] is transport agnostic: it keeps every change it has seen in
//! a [`ChangeLog`] and pushes newly released changes to every connected peer
//! except the change's author. Both the in-memory hub and the TCP server
//! drive the same core.

use crate::error::TransportError;
use crate::protocol::SyncMessage;
use dashmap::DashMap;
use flowsync_crdt::{CausalContext, Change, ChangeLog, Offer};
use flowsync_model::ReplicaId;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Outgoing side of one relay connection
pub trait PeerSink: Send + Sync {
    /// Queue a message; `false` if the peer is gone
    fn deliver(&self, msg: SyncMessage) -> bool;
}

impl PeerSink for mpsc::UnboundedSender<SyncMessage> {
    fn deliver(&self, msg: SyncMessage) -> bool {
        self.send(msg).is_ok()
    }
}

/// Relay-assigned connection number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Peer {
    replica: Option<ReplicaId>,
    sink: Box<dyn PeerSink>,
}

/// Relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Connections accepted since start
    pub connections: u64,
    /// Currently connected peers
    pub active_peers: usize,
    /// Changes in the relay log
    pub changes_stored: usize,
    /// Changes waiting for dependencies
    pub changes_pending: usize,
    /// Changes received, including duplicates
    pub changes_received: u64,
    /// Duplicate changes dropped
    pub duplicates: u64,
    /// Change deliveries to peers
    pub changes_forwarded: u64,
    /// Malformed changes dropped
    pub rejected: u64,
}

/// Shared relay state
pub struct RelayCore {
    log: Mutex<ChangeLog>,
    peers: DashMap<ConnectionId, Peer>,
    next_id: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("peers", &self.peers.len())
            .field("changes", &self.log.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for RelayCore {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCore {
    /// Relay with an empty change log
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Mutex::new(ChangeLog::new()),
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
            received: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Add a connection
    pub fn register(&self, sink: impl PeerSink + 'static) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.peers.insert(
            id,
            Peer {
                replica: None,
                sink: Box::new(sink),
            },
        );
        debug!(connection = %id, "peer registered");
        id
    }

    /// Drop a connection; its sink is released
    pub fn unregister(&self, conn: ConnectionId) -> bool {
        let removed = self.peers.remove(&conn);
        if let Some((_, peer)) = &removed {
            debug!(connection = %conn, replica = ?peer.replica, "peer unregistered");
        }
        removed.is_some()
    }

    /// Drop every connection
    pub fn unregister_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.peers.iter().map(|p| *p.key()).collect();
        ids.into_iter().filter(|id| self.unregister(*id)).count()
    }

    /// Process one message from a connection
    ///
    /// # Errors
    /// - `Closed` if the connection is not registered
    /// - `Protocol` if the message is one only the relay sends
    pub fn handle(&self, conn: ConnectionId, msg: SyncMessage) -> Result<(), TransportError> {
        trace!(connection = %conn, kind = msg.kind(), "relay received");
        match msg {
            SyncMessage::Hello {
                replica,
                state_vector,
            } => {
                {
                    let mut peer = self.peers.get_mut(&conn).ok_or(TransportError::Closed)?;
                    peer.replica = Some(replica);
                }
                let welcome = {
                    let log = self.log.lock();
                    SyncMessage::Welcome {
                        state_vector: log.context().clone(),
                        changes: log.since(&state_vector),
                    }
                };
                info!(
                    connection = %conn,
                    %replica,
                    missing = welcome.change_count(),
                    "replica joined"
                );
                self.send_to(conn, welcome)
            }
            SyncMessage::Changes { changes } => {
                let released = self.accept(changes);
                self.broadcast(&released);
                Ok(())
            }
            SyncMessage::Ping => self.send_to(conn, SyncMessage::Pong),
            SyncMessage::Pong => Ok(()),
            SyncMessage::Welcome { .. } => Err(TransportError::Protocol(
                "welcome is only sent by the relay".to_string(),
            )),
        }
    }

    fn accept(&self, changes: Vec<Change>) -> Vec<Change> {
        let mut released = Vec::new();
        let mut log = self.log.lock();
        for change in changes {
            self.received.fetch_add(1, Ordering::Relaxed);
            let id = change.id();
            match log.offer(change) {
                Ok(Offer::Ready(ready)) => released.extend(ready),
                Ok(Offer::Buffered) => debug!(change = %id, "relay buffered change"),
                Ok(Offer::Duplicate) => {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(change = %id, error = %err, "relay dropped malformed change");
                }
            }
        }
        released
    }

    /// Forward changes to every peer except their authors
    fn broadcast(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for peer in &self.peers {
            let subset: Vec<Change> = changes
                .iter()
                .filter(|c| Some(c.actor()) != peer.replica)
                .cloned()
                .collect();
            if subset.is_empty() {
                continue;
            }
            let count = subset.len() as u64;
            if peer.sink.deliver(SyncMessage::Changes { changes: subset }) {
                self.forwarded.fetch_add(count, Ordering::Relaxed);
            } else {
                dead.push(*peer.key());
            }
        }

        for conn in dead {
            self.unregister(conn);
        }
    }

    fn send_to(&self, conn: ConnectionId, msg: SyncMessage) -> Result<(), TransportError> {
        let delivered = self
            .peers
            .get(&conn)
            .is_some_and(|peer| peer.sink.deliver(msg));
        if delivered {
            Ok(())
        } else {
            self.unregister(conn);
            Err(TransportError::Closed)
        }
    }

    /// State vector of the relay log
    #[must_use]
    pub fn state_vector(&self) -> CausalContext {
        self.log.lock().context().clone()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let (stored, pending) = {
            let log = self.log.lock();
            (log.len(), log.pending_len())
        };
        RelayStats {
            connections: self.next_id.load(Ordering::Relaxed) - 1,
            active_peers: self.peers.len(),
            changes_stored: stored,
            changes_pending: pending,
            changes_received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            changes_forwarded: self.forwarded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
