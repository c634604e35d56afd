//! Wire protocol
//!
//! A client opens with [`SyncMessage::Hello`] carrying its state vector. The
//! relay answers with [`SyncMessage::Welcome`]: its own state vector plus
//! every change the client is missing. The client then sends whatever the
//! relay's vector lacks. After the handshake both sides push
//! [`SyncMessage::Changes`] as they happen.

use flowsync_crdt::{CausalContext, Change};
use flowsync_model::ReplicaId;
use serde::{Deserialize, Serialize};

/// Protocol revision, reported by `flowsync-relay report`
pub const PROTOCOL_VERSION: u32 = 1;

/// Message exchanged between a replica and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Client handshake
    Hello {
        /// Connecting replica
        replica: ReplicaId,
        /// Changes the replica has applied
        state_vector: CausalContext,
    },

    /// Relay handshake reply
    Welcome {
        /// Changes the relay holds
        state_vector: CausalContext,
        /// Changes the replica is missing
        changes: Vec<Change>,
    },

    /// Changes in causal order
    Changes {
        /// Changes to apply
        changes: Vec<Change>,
    },

    /// Liveness probe
    Ping,
    /// Reply to `Ping`
    Pong,
}

impl SyncMessage {
    /// Message name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Changes { .. } => "changes",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Number of changes carried
    #[must_use]
    pub fn change_count(&self) -> usize {
        match self {
            Self::Welcome { changes, .. } | Self::Changes { changes } => changes.len(),
            _ => 0,
        }
    }
}
