//! Session errors

use crate::config::ConfigError;
use flowsync_crdt::MergeError;
use flowsync_model::EntityId;
use flowsync_transport::TransportError;

/// Errors returned by [`FlowSession`](crate::FlowSession)
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Collaborative editing is switched off
    #[error("collaborative editing is disabled")]
    FeatureDisabled,

    /// The first handshake with the relay has not completed
    #[error("document is not ready")]
    NotReady,

    /// Mutation targets an entity that is not live
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Mutation rejected by the replica
    #[error("merge error: {0}")]
    Merge(MergeError),

    /// Connection failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Waiting for the document timed out
    #[error("timed out after {waited_ms}ms")]
    Timeout {
        /// How long was waited
        waited_ms: u64,
    },
}

impl From<MergeError> for SessionError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::NotFound(id) => Self::EntityNotFound(id),
            other => Self::Merge(other),
        }
    }
}
