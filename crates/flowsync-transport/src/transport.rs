//! Transport traits
//!
//! A [`Transport`] is one live connection between a replica and the relay.
//! A [`Connector`] opens new connections, so a session can reconnect after
//! the current one fails.

use crate::error::TransportError;
use crate::protocol::SyncMessage;
use async_trait::async_trait;

/// One bidirectional connection
///
/// # Cancellation
/// `recv` must be cancel safe: dropping a pending `recv` future loses no
/// message. Sessions poll it inside `tokio::select!`.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send one message
    ///
    /// # Errors
    /// Returns `Closed` once the connection is gone
    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError>;

    /// Next message; `Ok(None)` once the other side closed the connection
    ///
    /// # Errors
    /// Returns error if the connection failed
    async fn recv(&self) -> Result<Option<SyncMessage>, TransportError>;

    /// Close the connection; later sends fail
    async fn close(&self);

    /// Human readable description of the other end
    fn peer(&self) -> String;
}

/// Factory for connections to one relay
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a new connection
    ///
    /// # Errors
    /// Returns error if the relay cannot be reached
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;

    /// Address or name of the relay
    fn target(&self) -> String;
}
