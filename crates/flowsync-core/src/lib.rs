//! flowsync Core
//!
//! Collaborative editing sessions over the replicated flow document.
//!
//! # Core Concepts
//!
//! - [`FlowSession`]: one editor's replica plus the task syncing it with the
//!   relay; exposes the mutation API
//! - [`SyncConfig`] / [`ConfigLoader`]: TOML configuration with `${VAR}`
//!   expansion and environment overrides
//! - [`SyncState`]: connection state, observable through a watch channel
//! - [`DocumentEvent`]: change notifications for local and remote edits
//!
//! # Example
//!
//! ```rust,no_run
//! use flowsync_core::{FlowSession, SyncConfig};
//! use flowsync_model::{Node, Workspace};
//! use flowsync_transport::TcpConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), flowsync_core::SessionError> {
//! let config = SyncConfig::default();
//! let connector = Arc::new(TcpConnector::new(config.relay_addr.clone()));
//! let session = FlowSession::start(config, connector)?;
//! session.wait_ready(Duration::from_secs(5)).await?;
//!
//! session.add_node(Workspace::new("ws1", "Flow 1").into())?;
//! session.add_node(Node::new("n1", "inject").on("ws1").into())?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod config;
mod error;
mod session;
mod state;
mod sync;

pub use config::{
    ConfigError, ConfigLoader, ReconnectPolicy, SyncConfig, DEFAULT_RELAY_ADDR, ENV_ENABLED,
    ENV_RELAY_ADDR,
};
pub use error::SessionError;
pub use session::FlowSession;
pub use state::{DocumentEvent, SyncState};
