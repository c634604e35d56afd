//! Connection state and document events

use flowsync_crdt::OpId;
use flowsync_model::EntityId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Where the session stands with the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// Collaborative editing is switched off
    Disabled,
    /// First connection attempt in progress
    Connecting,
    /// Connected and caught up
    Synced,
    /// Connection lost; local edits are queued
    Degraded {
        /// Last connection error
        reason: String,
        /// Consecutive failed attempts
        attempt: u32,
    },
    /// Session shut down or gave up reconnecting
    Stopped,
}

impl SyncState {
    /// Whether the session is connected and caught up
    #[inline]
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Whether the session will not connect again
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disabled | Self::Stopped)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Connecting => f.write_str("connecting"),
            Self::Synced => f.write_str("synced"),
            Self::Degraded { reason, attempt } => {
                write!(f, "degraded (attempt {attempt}: {reason})")
            }
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Notification that the document changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// First handshake completed; the document can be read
    Ready,
    /// A local mutation was applied
    LocalChange {
        /// The new change
        change: OpId,
        /// Entities it wrote
        touched: BTreeSet<EntityId>,
    },
    /// Changes from other replicas were merged
    RemoteChange {
        /// Applied changes, in application order
        changes: Vec<OpId>,
        /// Entities they wrote
        touched: BTreeSet<EntityId>,
    },
}
