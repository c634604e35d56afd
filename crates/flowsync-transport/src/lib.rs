//! flowsync Transport
//!
//! Carries changes between replicas and the central relay.
//!
//! # Core Concepts
//!
//! - [`SyncMessage`]: the wire protocol (`hello` / `welcome` handshake, then
//!   `changes` in both directions)
//! - [`Transport`] / [`Connector`]: one connection, and a way to open more
//! - [`RelayCore`]: store-and-forward logic shared by every relay flavour
//! - [`MemoryHub`]: in-process relay with fault injection
//! - [`RelayServer`] / [`TcpTransport`]: length-prefixed JSON over TCP
//!
//! Delivery is at-least-once and unordered; the merge core on each replica
//! restores causal order and drops duplicates.

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod codec;
mod error;
mod memory;
mod protocol;
mod relay;
mod server;
mod tcp;
mod transport;

pub use codec::{encode_frame, read_frame, write_frame, MAX_FRAME_LEN};
pub use error::TransportError;
pub use memory::{FaultConfig, MemoryConnector, MemoryHub, MemoryTransport};
pub use protocol::{SyncMessage, PROTOCOL_VERSION};
pub use relay::{ConnectionId, PeerSink, RelayCore, RelayStats};
pub use server::RelayServer;
pub use tcp::{TcpConnector, TcpTransport};
pub use transport::{Connector, Transport};
