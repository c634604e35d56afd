//! flowsync Relay
//!
//! Library side of the `flowsync-relay` binary: the seeded convergence
//! simulator and version information shared by the CLI.

#![warn(unreachable_pub)]
#![warn(missing_docs)]

/// Seeded convergence simulator
pub mod simulator;

pub use simulator::{
    run_simulator, SimulatedOperation, SimulatorConfig, SimulatorReport, SimulatorStats,
    Violation,
};

use flowsync_crdt::{MergeCore, ObservedCore};
use flowsync_model::ReplicaId;
use serde::Serialize;

/// Version information printed by `flowsync-relay report`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReport {
    /// Version of this binary
    pub relay_version: &'static str,
    /// Version of the entity model
    pub model_version: &'static str,
    /// Wire protocol revision
    pub protocol_version: u32,
    /// Name of the default merge core
    pub merge_core: &'static str,
    /// Relay address used when none is configured
    pub default_relay_addr: &'static str,
}

impl VersionReport {
    /// Versions compiled into this binary
    #[must_use]
    pub fn current() -> Self {
        Self {
            relay_version: env!("CARGO_PKG_VERSION"),
            model_version: flowsync_model::VERSION,
            protocol_version: flowsync_transport::PROTOCOL_VERSION,
            merge_core: ObservedCore::new(ReplicaId::from_u128(0)).name(),
            default_relay_addr: flowsync_core::DEFAULT_RELAY_ADDR,
        }
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        format!(
            "flowsync relay {}\n  model: {}\n  protocol: v{}\n  merge core: {}\n  default relay: {}\n",
            self.relay_version,
            self.model_version,
            self.protocol_version,
            self.merge_core,
            self.default_relay_addr,
        )
    }
}
