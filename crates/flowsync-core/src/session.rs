//! Collaborative editing session
//!
//! A [`FlowSession`] owns one replica of the flow document and a background
//! task that keeps it in sync with the relay. Mutations apply to the local
//! replica immediately and are queued for the sync task; they never wait for
//! the network.

use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::state::{DocumentEvent, SyncState};
use crate::sync::SyncTask;
use flowsync_crdt::{
    ApplyOutcome, CausalContext, Change, MergeCore, MergeError, ObservedCore, OpId, Replica,
};
use flowsync_model::{Document, Entity, EntityId, EntityKind, Fields, PositionUpdate, ReplicaId};
use flowsync_transport::{Connector, SyncMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// State shared between the session handle and its sync task
pub(crate) struct Shared<C: MergeCore> {
    replica: Mutex<Replica<C>>,
    outbox: mpsc::UnboundedSender<Change>,
    ready: AtomicBool,
    events: broadcast::Sender<DocumentEvent>,
    state: watch::Sender<SyncState>,
}

impl<C: MergeCore> Shared<C> {
    /// Handshake opener carrying the current state vector
    pub(crate) fn hello(&self) -> SyncMessage {
        let replica = self.replica.lock();
        SyncMessage::Hello {
            replica: replica.actor(),
            state_vector: replica.state_vector(),
        }
    }

    /// Merge changes received from the relay
    pub(crate) fn merge_remote(&self, changes: Vec<Change>) {
        let mut applied = Vec::new();
        let mut touched = BTreeSet::new();
        {
            let mut replica = self.replica.lock();
            for change in changes {
                let id = change.id();
                match replica.apply_remote(change) {
                    Ok(ApplyOutcome::Applied {
                        changes,
                        touched: entities,
                    }) => {
                        applied.extend(changes);
                        touched.extend(entities);
                    }
                    Ok(ApplyOutcome::Buffered) => {
                        debug!(change = %id, "remote change waiting for dependencies");
                    }
                    Ok(ApplyOutcome::Duplicate) => trace!(change = %id, "duplicate remote change"),
                    Err(err) => warn!(change = %id, error = %err, "dropping malformed remote change"),
                }
            }
        }

        if !applied.is_empty() {
            debug!(count = applied.len(), touched = touched.len(), "merged remote changes");
            self.emit(DocumentEvent::RemoteChange {
                changes: applied,
                touched,
            });
        }
    }

    /// Merge a `Welcome` and return the local changes the relay lacks
    pub(crate) fn resync(&self, state_vector: &CausalContext, changes: Vec<Change>) -> Vec<Change> {
        self.merge_remote(changes);
        self.replica.lock().changes_since(state_vector)
    }

    pub(crate) fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            info!("document ready");
            self.emit(DocumentEvent::Ready);
        }
        self.set_state(SyncState::Synced);
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            debug!(from = %previous, to = %state, "sync state changed");
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn emit(&self, event: DocumentEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Handle to one collaborative editing session
///
/// # Lifecycle
///
/// [`FlowSession::start`] spawns the sync task, so it must run inside a tokio
/// runtime. The document becomes readable after the first handshake with the
/// relay ([`FlowSession::wait_ready`]); from then on edits keep working while
/// the relay is unreachable and are delivered after reconnecting.
/// [`FlowSession::shutdown`] stops the task; dropping the handle does too.
pub struct FlowSession<C: MergeCore + 'static = ObservedCore> {
    enabled: bool,
    actor: ReplicaId,
    shared: Arc<Shared<C>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowSession<ObservedCore> {
    /// Start a session with the default merge core
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid
    pub fn start(config: SyncConfig, connector: Arc<dyn Connector>) -> Result<Self, SessionError> {
        let actor = config.replica_id.unwrap_or_default();
        Self::start_with_core(config, ObservedCore::new(actor), connector)
    }
}

impl<C: MergeCore + 'static> FlowSession<C> {
    /// Start a session over a given merge core
    ///
    /// The core's actor is the replica id; `config.replica_id` is ignored.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid
    pub fn start_with_core(
        config: SyncConfig,
        core: C,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let replica = Replica::with_core(core);
        let actor = replica.actor();
        let (outbox, queued) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let initial = if config.enabled {
            SyncState::Connecting
        } else {
            SyncState::Disabled
        };
        let (state, _) = watch::channel(initial);
        let (shutdown, stop) = watch::channel(false);

        let shared = Arc::new(Shared {
            replica: Mutex::new(replica),
            outbox,
            ready: AtomicBool::new(false),
            events,
            state,
        });

        let task = if config.enabled {
            info!(replica = %actor, relay = %connector.target(), core = shared.replica.lock().core().name(), "starting flow session");
            let sync = SyncTask::new(Arc::clone(&shared), connector, queued, stop, &config);
            Some(tokio::spawn(sync.run()))
        } else {
            info!(replica = %actor, "collaborative editing disabled");
            None
        };

        Ok(Self {
            enabled: config.enabled,
            actor,
            shared,
            shutdown,
            task: Mutex::new(task),
        })
    }

    /// Whether collaborative editing is switched on
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Id this session authors changes as
    #[inline]
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.actor
    }

    /// Whether the first handshake has completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.enabled && self.shared.is_ready()
    }

    /// Snapshot of the document; `None` until the session is ready
    #[must_use]
    pub fn get_document(&self) -> Option<Document> {
        self.is_ready()
            .then(|| self.shared.replica.lock().snapshot())
    }

    /// One live entity
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        if !self.is_ready() {
            return None;
        }
        self.shared.replica.lock().get(id)
    }

    /// Concurrent values of one field, in stamp order; the visible one last
    #[must_use]
    pub fn conflicts(&self, id: &EntityId, field: &str) -> Vec<Value> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.shared.replica.lock().conflicts(id, field)
    }

    /// Changes the local replica has applied
    #[must_use]
    pub fn state_vector(&self) -> CausalContext {
        self.shared.replica.lock().state_vector()
    }

    /// Add a node, workspace, subflow or group
    ///
    /// # Errors
    /// - `FeatureDisabled` / `NotReady` before the session can edit
    /// - `Merge` if the id is taken or `z` names no live container
    pub fn add_node(&self, entity: Entity) -> Result<OpId, SessionError> {
        let id = entity.id().clone();
        let op = self.mutate(|replica| replica.add_node(entity).map(Some))?;
        debug!(entity = %id, "added");
        op.ok_or(SessionError::Merge(MergeError::EmptyChange))
    }

    /// Overwrite some fields of an entity; `null` clears a field
    ///
    /// Returns `false` if every field already had the given value.
    ///
    /// # Errors
    /// - `FeatureDisabled` / `NotReady` before the session can edit
    /// - `EntityNotFound` if the entity is not live
    /// - `Merge` for an `id`/`type` change or an invalid result
    pub fn update_node(&self, id: &EntityId, fields: Fields) -> Result<bool, SessionError> {
        let op = self.mutate(|replica| replica.update_node(id, fields))?;
        Ok(op.is_some())
    }

    /// Remove an entity; containers take their children with them
    ///
    /// # Errors
    /// - `FeatureDisabled` / `NotReady` before the session can edit
    /// - `EntityNotFound` if the entity is not live
    pub fn remove_node(
        &self,
        id: &EntityId,
        kind_hint: Option<EntityKind>,
    ) -> Result<OpId, SessionError> {
        let op = self.mutate(|replica| replica.remove_node(id, kind_hint).map(Some))?;
        op.ok_or(SessionError::Merge(MergeError::EmptyChange))
    }

    /// Move several entities at once; returns how many moved
    ///
    /// # Errors
    /// `FeatureDisabled` / `NotReady` before the session can edit
    pub fn batch_position_update(&self, updates: &[PositionUpdate]) -> Result<usize, SessionError> {
        let mut moved = 0;
        self.mutate(|replica| {
            let change = replica.batch_position_update(updates)?;
            moved = change.as_ref().map_or(0, |c| c.ops().len());
            Ok(change)
        })?;
        Ok(moved)
    }

    /// Replace the workspace order
    ///
    /// # Errors
    /// `FeatureDisabled` / `NotReady` before the session can edit
    pub fn set_workspace_order(&self, order: Vec<EntityId>) -> Result<OpId, SessionError> {
        let op = self.mutate(|replica| replica.set_workspace_order(order).map(Some))?;
        op.ok_or(SessionError::Merge(MergeError::EmptyChange))
    }

    /// Document change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.shared.events.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.shared.state.borrow().clone()
    }

    /// Receiver following every state transition
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    /// Wait for the first handshake to complete
    ///
    /// # Errors
    /// - `FeatureDisabled` if collaborative editing is off
    /// - `NotReady` if the session stopped before becoming ready
    /// - `Timeout` if `timeout` elapsed first
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        if !self.enabled {
            return Err(SessionError::FeatureDisabled);
        }

        let mut state = self.shared.state.subscribe();
        let shared = Arc::clone(&self.shared);
        let waited = tokio::time::timeout(
            timeout,
            state.wait_for(move |s| shared.is_ready() || s.is_terminal()),
        )
        .await;

        match waited {
            Err(_) => Err(SessionError::Timeout {
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Ok(_) if self.shared.is_ready() => Ok(()),
            Ok(_) => Err(SessionError::NotReady),
        }
    }

    /// Stop the sync task and wait for it to finish
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
        if !self.enabled {
            return;
        }
        self.shared.set_state(SyncState::Stopped);
        info!(replica = %self.actor, "flow session stopped");
    }

    fn check_ready(&self) -> Result<(), SessionError> {
        if !self.enabled {
            return Err(SessionError::FeatureDisabled);
        }
        if !self.shared.is_ready() {
            return Err(SessionError::NotReady);
        }
        Ok(())
    }

    /// Run a local mutation and queue its change for the relay
    fn mutate<F>(&self, f: F) -> Result<Option<OpId>, SessionError>
    where
        F: FnOnce(&mut Replica<C>) -> Result<Option<Change>, MergeError>,
    {
        self.check_ready()?;

        let change = {
            let mut replica = self.shared.replica.lock();
            let Some(change) = f(&mut replica)? else {
                return Ok(None);
            };
            // Queued under the lock so the outbox keeps causal order
            if self.shared.outbox.send(change.clone()).is_err() {
                debug!(change = %change.id(), "sync task gone; change kept locally");
            }
            change
        };

        let id = change.id();
        trace!(change = %id, ops = change.ops().len(), "local change queued");
        self.shared.emit(DocumentEvent::LocalChange {
            change: id,
            touched: change.touched(),
        });
        Ok(Some(id))
    }
}

impl<C: MergeCore + 'static> std::fmt::Debug for FlowSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSession")
            .field("replica", &self.actor)
            .field("enabled", &self.enabled)
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<C: MergeCore + 'static> Drop for FlowSession<C> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_model::{Node, Workspace};
    use flowsync_transport::MemoryHub;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(hub: &MemoryHub) -> FlowSession {
        FlowSession::start(SyncConfig::default(), Arc::new(hub.connector())).unwrap()
    }

    #[tokio::test]
    async fn disabled_session_refuses_everything() {
        let hub = MemoryHub::new();
        let s = FlowSession::start(
            SyncConfig::default().with_enabled(false),
            Arc::new(hub.connector()),
        )
        .unwrap();

        assert!(!s.is_enabled());
        assert_eq!(s.sync_state(), SyncState::Disabled);
        assert!(s.get_document().is_none());
        assert!(matches!(
            s.add_node(Workspace::new("ws1", "Flow 1").into()),
            Err(SessionError::FeatureDisabled)
        ));
        assert!(matches!(
            s.wait_ready(WAIT).await,
            Err(SessionError::FeatureDisabled)
        ));
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test]
    async fn not_ready_until_relay_answers() {
        let hub = MemoryHub::new();
        hub.set_online(false);
        let s = session(&hub);

        assert!(s.get_document().is_none());
        assert!(matches!(
            s.add_node(Workspace::new("ws1", "Flow 1").into()),
            Err(SessionError::NotReady)
        ));
        assert!(matches!(
            s.wait_ready(Duration::from_millis(50)).await,
            Err(SessionError::Timeout { waited_ms: 50 })
        ));

        hub.set_online(true);
        s.wait_ready(WAIT).await.unwrap();
        assert_eq!(s.get_document(), Some(Document::new()));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn local_mutations_emit_events() {
        let hub = MemoryHub::new();
        let s = session(&hub);
        s.wait_ready(WAIT).await.unwrap();
        let mut events = s.subscribe();

        s.add_node(Workspace::new("ws1", "Flow 1").into()).unwrap();
        s.add_node(Node::new("n1", "inject").on("ws1").into())
            .unwrap();

        match events.recv().await.unwrap() {
            DocumentEvent::LocalChange { touched, .. } => {
                assert!(touched.contains(&EntityId::from("ws1")));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(s.get(&"n1".into()).is_some());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn errors_map_to_session_errors() {
        let hub = MemoryHub::new();
        let s = session(&hub);
        s.wait_ready(WAIT).await.unwrap();

        let missing = EntityId::from("missing");
        assert!(matches!(
            s.remove_node(&missing, None),
            Err(SessionError::EntityNotFound(id)) if id == missing
        ));
        assert!(matches!(
            s.add_node(Node::new("n1", "inject").on("nowhere").into()),
            Err(SessionError::Merge(MergeError::UnknownWorkspace { .. }))
        ));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_update_reports_false() {
        let hub = MemoryHub::new();
        let s = session(&hub);
        s.wait_ready(WAIT).await.unwrap();
        s.add_node(Workspace::new("ws1", "Flow 1").into()).unwrap();

        let mut fields = Fields::new();
        fields.insert("label".into(), Value::from("Flow 1"));
        assert!(!s.update_node(&"ws1".into(), fields).unwrap());

        let mut fields = Fields::new();
        fields.insert("label".into(), Value::from("Renamed"));
        assert!(s.update_node(&"ws1".into(), fields).unwrap());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let hub = MemoryHub::new();
        let s = session(&hub);
        s.wait_ready(WAIT).await.unwrap();

        s.shutdown().await;
        assert_eq!(s.sync_state(), SyncState::Stopped);
        // Still readable after shutdown
        assert!(s.get_document().is_some());
    }
}
