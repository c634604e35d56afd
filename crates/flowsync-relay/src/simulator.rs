//! Convergence simulator
//!
//! Drives several sessions through a memory hub with injected faults:
//! 1. Edit phase: seeded random mutations on random replicas while the hub
//!    drops, duplicates and delays messages and occasionally cuts every
//!    connection
//! 2. Settle phase: faults are removed and all replicas must reach the same
//!    document digest within the settle timeout
//!
//! Invariants checked after settling:
//! - Every replica holds the same document
//! - Workspace order lists exactly the live workspaces
//! - No visible entity sits in a container that is not visible

use flowsync_core::{FlowSession, ReconnectPolicy, SessionError, SyncConfig};
use flowsync_crdt::MergeError;
use flowsync_model::{Document, EntityId, Fields, Node, PositionUpdate, ReplicaId, Subflow, Workspace};
use flowsync_transport::{FaultConfig, MemoryHub};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of replicas
    pub replicas: usize,
    /// Total mutations across all replicas
    pub operations: u64,
    /// Probability that a message is lost
    pub drop_rate: f64,
    /// Probability that a message is delivered twice
    pub duplicate_rate: f64,
    /// Upper bound for injected delivery delay
    pub max_delay_ms: u64,
    /// Probability that an operation is replaced by a hub-wide disconnect
    pub disconnect_rate: f64,
    /// How long replicas get to converge once faults stop
    pub settle_timeout_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            replicas: 3,
            operations: 200,
            drop_rate: 0.1,
            duplicate_rate: 0.1,
            max_delay_ms: 10,
            disconnect_rate: 0.01,
            settle_timeout_ms: 10_000,
        }
    }
}

/// Mutation chosen by the generator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SimulatedOperation {
    /// Add a workspace
    AddWorkspace {
        /// Acting replica
        replica: usize,
        /// New workspace id
        id: EntityId,
    },
    /// Add a subflow
    AddSubflow {
        /// Acting replica
        replica: usize,
        /// New subflow id
        id: EntityId,
    },
    /// Add a node to a container
    AddNode {
        /// Acting replica
        replica: usize,
        /// New node id
        id: EntityId,
        /// Container
        z: EntityId,
    },
    /// Change an entity's name or label
    Rename {
        /// Acting replica
        replica: usize,
        /// Target entity
        id: EntityId,
        /// New name
        name: String,
    },
    /// Batch position update
    Move {
        /// Acting replica
        replica: usize,
        /// Nodes moved
        ids: Vec<EntityId>,
    },
    /// Remove an entity
    Remove {
        /// Acting replica
        replica: usize,
        /// Target entity
        id: EntityId,
    },
    /// Reorder the workspace tabs
    Reorder {
        /// Acting replica
        replica: usize,
        /// Written order
        order: Vec<EntityId>,
    },
    /// Drop every connection to the hub
    Disconnect,
}

/// A violation detected during simulation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A replica never completed its first handshake
    NeverReady {
        /// Replica index
        replica: usize,
    },
    /// A mutation generated from the replica's own view was rejected
    UnexpectedRejection {
        /// Rejected mutation
        operation: SimulatedOperation,
        /// Error returned
        error: String,
    },
    /// A replica's document differs from replica 0 after settling
    Diverged {
        /// Replica index
        replica: usize,
        /// Digest of replica 0
        expected: String,
        /// Digest of this replica
        actual: String,
    },
    /// Workspace order is not a permutation of the live workspaces
    WorkspaceOrder {
        /// Replica index
        replica: usize,
    },
    /// A visible entity references a container that is not visible
    Orphan {
        /// Replica index
        replica: usize,
        /// Orphaned entity
        id: EntityId,
    },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    /// Mutations generated
    pub operations_attempted: u64,
    /// Mutations the acting replica accepted
    pub operations_applied: u64,
    /// Rejected because a concurrent remote change got there first
    pub operations_stale: u64,
    /// Forced disconnects
    pub disconnects: u64,
    /// Changes held by the hub after settling
    pub changes_stored: usize,
    /// Duplicate deliveries ignored by the hub
    pub duplicates_dropped: u64,
    /// Time from healing the hub to convergence
    pub settle_ms: u64,
    /// Entities on replica 0 at the end
    pub final_entities: usize,
}

/// Final report from simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// Run statistics
    pub stats: SimulatorStats,
    /// Invariant violations; empty on success
    pub violations: Vec<Violation>,
    /// Digest of replica 0 after settling
    pub digest: Option<String>,
}

impl SimulatorReport {
    /// Check if simulation passed all criteria
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== flowsync Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Replicas: {}", self.config.replicas);
        let _ = writeln!(
            report,
            "Faults: drop {:.2}, duplicate {:.2}, delay <= {}ms",
            self.config.drop_rate, self.config.duplicate_rate, self.config.max_delay_ms
        );
        let _ = writeln!(report, "Operations Attempted: {}", self.stats.operations_attempted);
        let _ = writeln!(report, "Operations Applied: {}", self.stats.operations_applied);
        let _ = writeln!(report, "Operations Stale: {}", self.stats.operations_stale);
        let _ = writeln!(report, "Disconnects: {}", self.stats.disconnects);
        let _ = writeln!(report, "Changes Stored: {}", self.stats.changes_stored);
        let _ = writeln!(report, "Duplicates Dropped: {}", self.stats.duplicates_dropped);
        let _ = writeln!(report, "Settle Time: {}ms", self.stats.settle_ms);
        let _ = writeln!(report, "Final Entities: {}", self.stats.final_entities);
        if let Some(digest) = &self.digest {
            let _ = writeln!(report, "Digest: {digest}");
        }
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run the convergence simulator
///
/// Must be called inside a tokio runtime.
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    let hub = MemoryHub::new();
    let sessions = start_sessions(&hub, &config, &mut violations).await;
    if !violations.is_empty() || sessions.is_empty() {
        return finish(config, stats, violations, None, &sessions).await;
    }

    info!(
        seed = config.seed,
        replicas = sessions.len(),
        operations = config.operations,
        "simulation started"
    );
    hub.set_faults(
        FaultConfig::none()
            .with_drop_rate(config.drop_rate)
            .with_duplicate_rate(config.duplicate_rate)
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
            .with_seed(config.seed),
    );

    // Phase 1: edits under faults
    let mut next_id = 0u64;
    for _ in 0..config.operations {
        let operation = generate_operation(&mut rng, &config, &sessions, &mut next_id);
        stats.operations_attempted += 1;

        match execute_operation(&operation, &sessions, &hub) {
            Ok(()) => stats.operations_applied += 1,
            Err(err) if is_stale(&err) => {
                debug!(?operation, error = %err, "operation lost a race");
                stats.operations_stale += 1;
            }
            Err(err) => {
                warn!(?operation, error = %err, "operation rejected");
                violations.push(Violation::UnexpectedRejection {
                    operation: operation.clone(),
                    error: err.to_string(),
                });
            }
        }
        if matches!(operation, SimulatedOperation::Disconnect) {
            stats.disconnects += 1;
        }
        tokio::task::yield_now().await;
    }

    // Phase 2: heal and settle
    hub.set_faults(FaultConfig::none());
    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.settle_timeout_ms);
    while !all_converged(&sessions) && Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    stats.settle_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let relay = hub.stats();
    stats.changes_stored = relay.changes_stored;
    stats.duplicates_dropped = relay.duplicates;

    let digest = check_invariants(&sessions, &mut stats, &mut violations);
    finish(config, stats, violations, digest, &sessions).await
}

async fn start_sessions(
    hub: &MemoryHub,
    config: &SimulatorConfig,
    violations: &mut Vec<Violation>,
) -> Vec<FlowSession> {
    let mut sessions = Vec::with_capacity(config.replicas);
    for index in 0..config.replicas {
        let sync = SyncConfig::default()
            .with_replica_id(ReplicaId::from_u128(index as u128 + 1))
            .with_reconnect(ReconnectPolicy::immediate())
            .with_heartbeat_interval(Duration::from_millis(25))
            .with_handshake_timeout(Duration::from_millis(250));
        let session = match FlowSession::start(sync, Arc::new(hub.connector())) {
            Ok(session) => session,
            Err(err) => {
                warn!(replica = index, error = %err, "session failed to start");
                violations.push(Violation::NeverReady { replica: index });
                continue;
            }
        };
        if session.wait_ready(READY_TIMEOUT).await.is_err() {
            violations.push(Violation::NeverReady { replica: index });
        }
        sessions.push(session);
    }
    sessions
}

async fn finish(
    config: SimulatorConfig,
    stats: SimulatorStats,
    violations: Vec<Violation>,
    digest: Option<String>,
    sessions: &[FlowSession],
) -> SimulatorReport {
    for session in sessions {
        session.shutdown().await;
    }
    info!(violations = violations.len(), "simulation finished");
    SimulatorReport {
        config,
        stats,
        violations,
        digest,
    }
}

/// Pick a replica and a mutation that is valid on its current view
fn generate_operation(
    rng: &mut StdRng,
    config: &SimulatorConfig,
    sessions: &[FlowSession],
    next_id: &mut u64,
) -> SimulatedOperation {
    if rng.random_bool(config.disconnect_rate.clamp(0.0, 1.0)) {
        return SimulatedOperation::Disconnect;
    }

    let replica = rng.random_range(0..sessions.len());
    let doc = sessions[replica].get_document().unwrap_or_default();
    let mut fresh = |prefix: &str| {
        *next_id += 1;
        EntityId::new(format!("{prefix}-{next_id}"))
    };

    let containers: Vec<EntityId> = doc
        .workspaces
        .keys()
        .chain(doc.subflows.keys())
        .cloned()
        .collect();
    let nodes: Vec<EntityId> = doc.nodes.keys().cloned().collect();

    if containers.is_empty() {
        return SimulatedOperation::AddWorkspace {
            replica,
            id: fresh("ws"),
        };
    }

    match rng.random_range(0..100) {
        0..=9 => SimulatedOperation::AddWorkspace {
            replica,
            id: fresh("ws"),
        },
        10..=14 => SimulatedOperation::AddSubflow {
            replica,
            id: fresh("sf"),
        },
        15..=49 => SimulatedOperation::AddNode {
            replica,
            id: fresh("n"),
            z: pick(rng, &containers),
        },
        50..=64 if !nodes.is_empty() => SimulatedOperation::Rename {
            replica,
            id: pick(rng, &nodes),
            name: format!("node-{}", rng.random_range(0..1000)),
        },
        65..=79 if !nodes.is_empty() => {
            let count = rng.random_range(1..=nodes.len().min(4));
            let ids = (0..count).map(|_| pick(rng, &nodes)).collect();
            SimulatedOperation::Move { replica, ids }
        }
        80..=89 if !nodes.is_empty() => SimulatedOperation::Remove {
            replica,
            id: pick(rng, &nodes),
        },
        90..=93 => SimulatedOperation::Remove {
            replica,
            id: pick(rng, &containers),
        },
        94..=99 => {
            let mut order = doc.workspace_order.clone();
            if order.len() > 1 {
                let i = rng.random_range(0..order.len());
                let j = rng.random_range(0..order.len());
                order.swap(i, j);
            }
            SimulatedOperation::Reorder { replica, order }
        }
        _ => SimulatedOperation::AddNode {
            replica,
            id: fresh("n"),
            z: pick(rng, &containers),
        },
    }
}

fn pick(rng: &mut StdRng, ids: &[EntityId]) -> EntityId {
    ids[rng.random_range(0..ids.len())].clone()
}

fn execute_operation(
    operation: &SimulatedOperation,
    sessions: &[FlowSession],
    hub: &MemoryHub,
) -> Result<(), SessionError> {
    match operation {
        SimulatedOperation::AddWorkspace { replica, id } => {
            sessions[*replica].add_node(Workspace::new(id.clone(), format!("Flow {id}")).into())?;
        }
        SimulatedOperation::AddSubflow { replica, id } => {
            sessions[*replica].add_node(Subflow::new(id.clone(), format!("Subflow {id}")).into())?;
        }
        SimulatedOperation::AddNode { replica, id, z } => {
            let node = Node::new(id.clone(), "function").on(z.clone());
            sessions[*replica].add_node(node.into())?;
        }
        SimulatedOperation::Rename { replica, id, name } => {
            let mut fields = Fields::new();
            fields.insert("name".to_string(), json!(name));
            sessions[*replica].update_node(id, fields)?;
        }
        SimulatedOperation::Move { replica, ids } => {
            let updates: Vec<PositionUpdate> = (0u32..)
                .zip(ids)
                .map(|(i, id)| PositionUpdate::new(id.clone(), f64::from(i) * 20.0, 40.0))
                .collect();
            sessions[*replica].batch_position_update(&updates)?;
        }
        SimulatedOperation::Remove { replica, id } => {
            sessions[*replica].remove_node(id, None)?;
        }
        SimulatedOperation::Reorder { replica, order } => {
            sessions[*replica].set_workspace_order(order.clone())?;
        }
        SimulatedOperation::Disconnect => {
            let dropped = hub.disconnect_all();
            debug!(dropped, "hub connections cut");
        }
    }
    Ok(())
}

/// Errors caused by a remote change landing between generation and apply
fn is_stale(err: &SessionError) -> bool {
    match err {
        SessionError::EntityNotFound(_) => true,
        SessionError::Merge(merge) => matches!(
            merge,
            MergeError::UnknownWorkspace { .. } | MergeError::NotFound(_)
        ),
        _ => false,
    }
}

fn all_converged(sessions: &[FlowSession]) -> bool {
    let mut docs = sessions.iter().map(FlowSession::get_document);
    let Some(Some(first)) = docs.next() else {
        return false;
    };
    docs.all(|doc| doc.as_ref() == Some(&first))
}

fn check_invariants(
    sessions: &[FlowSession],
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) -> Option<String> {
    let docs: Vec<Document> = sessions
        .iter()
        .map(|s| s.get_document().unwrap_or_default())
        .collect();
    let reference = docs.first()?;
    let expected = reference.digest().map(|d| d.to_string()).ok()?;
    stats.final_entities = reference.len();

    for (replica, doc) in docs.iter().enumerate() {
        let actual = doc.digest().map(|d| d.to_string()).unwrap_or_default();
        if actual != expected {
            violations.push(Violation::Diverged {
                replica,
                expected: expected.clone(),
                actual,
            });
        }

        let mut order = doc.workspace_order.clone();
        order.sort();
        let live: Vec<EntityId> = doc.workspaces.keys().cloned().collect();
        if order != live {
            violations.push(Violation::WorkspaceOrder { replica });
        }

        let parents = doc
            .nodes
            .values()
            .filter_map(|n| n.z.as_ref().map(|z| (&n.id, z)))
            .chain(doc.groups.values().filter_map(|g| g.z.as_ref().map(|z| (&g.id, z))));
        for (id, z) in parents {
            if !doc.workspaces.contains_key(z) && !doc.subflows.contains_key(z) {
                violations.push(Violation::Orphan {
                    replica,
                    id: id.clone(),
                });
            }
        }
    }

    Some(expected)
}
