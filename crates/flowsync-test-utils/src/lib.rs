//! Testing utilities for the flowsync workspace
//!
//! Shared fixtures for entities, sessions wired to a memory hub, and polling
//! helpers for eventually-consistent assertions.

#![warn(missing_docs)]

use flowsync_core::{FlowSession, ReconnectPolicy, SyncConfig};
use flowsync_model::{Fields, Node, Subflow, Workspace};
use flowsync_transport::MemoryHub;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in tests
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Enabled workspace
pub fn tab(id: &str, label: &str) -> Workspace {
    Workspace::new(id, label)
}

/// Subflow without ports
pub fn subflow(id: &str, name: &str) -> Subflow {
    Subflow::new(id, name)
}

/// Inject node placed on a workspace
pub fn inject_node(id: &str, name: &str, z: &str) -> Node {
    Node::new(id, "inject").with_name(name).on(z).at(100.0, 100.0)
}

/// Field map from a JSON object literal
pub fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Config with fast reconnects, heartbeats and handshake timeouts
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_reconnect(ReconnectPolicy::immediate())
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_handshake_timeout(Duration::from_millis(500))
}

/// Session connected to `hub`, not yet ready
pub fn start_session(hub: &MemoryHub) -> FlowSession {
    FlowSession::start(test_config(), Arc::new(hub.connector())).unwrap()
}

/// Session connected to `hub` that completed its first handshake
pub async fn ready_session(hub: &MemoryHub) -> FlowSession {
    let session = start_session(hub);
    session.wait_ready(SYNC_TIMEOUT).await.unwrap();
    session
}

/// `count` ready sessions sharing one hub
pub async fn ready_sessions(hub: &MemoryHub, count: usize) -> Vec<FlowSession> {
    let mut sessions = Vec::with_capacity(count);
    for _ in 0..count {
        sessions.push(ready_session(hub).await);
    }
    sessions
}

/// Poll `check` until it holds or [`SYNC_TIMEOUT`] passes
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + SYNC_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Whether every session shows the same document
pub fn converged(sessions: &[FlowSession]) -> bool {
    let mut docs = sessions.iter().map(FlowSession::get_document);
    let Some(first) = docs.next() else {
        return true;
    };
    first.is_some() && docs.all(|doc| doc == first)
}
