//! Background sync task
//!
//! Connects to the relay, performs the `Hello` / `Welcome` handshake and then
//! pumps changes both ways until the connection fails, at which point it
//! backs off and reconnects. Every handshake re-sends whatever local changes
//! the relay's state vector lacks, so nothing queued while offline is lost.

use crate::config::{ReconnectPolicy, SyncConfig};
use crate::error::SessionError;
use crate::session::Shared;
use crate::state::SyncState;
use flowsync_crdt::{CausalContext, Change, MergeCore};
use flowsync_transport::{Connector, SyncMessage, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

enum Disconnect {
    Shutdown,
    Lost(String),
}

pub(crate) struct SyncTask<C: MergeCore> {
    shared: Arc<Shared<C>>,
    connector: Arc<dyn Connector>,
    outbox: mpsc::UnboundedReceiver<Change>,
    shutdown: watch::Receiver<bool>,
    policy: ReconnectPolicy,
    heartbeat: Duration,
    handshake_timeout: Duration,
}

impl<C: MergeCore + 'static> SyncTask<C> {
    pub(crate) fn new(
        shared: Arc<Shared<C>>,
        connector: Arc<dyn Connector>,
        outbox: mpsc::UnboundedReceiver<Change>,
        shutdown: watch::Receiver<bool>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            shared,
            connector,
            outbox,
            shutdown,
            policy: config.reconnect.clone(),
            heartbeat: config.heartbeat_interval(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    pub(crate) async fn run(mut self) {
        let target = self.connector.target();
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                () = stopped(&mut self.shutdown) => break,
                result = connect(
                    self.connector.as_ref(),
                    &self.shared,
                    &mut self.outbox,
                    self.handshake_timeout,
                ) => result,
            };

            let reason = match connected {
                Ok(transport) => {
                    info!(relay = %target, peer = %transport.peer(), "connected to relay");
                    attempt = 0;
                    let end = self.pump(transport.as_ref()).await;
                    transport.close().await;
                    match end {
                        Disconnect::Shutdown => break,
                        Disconnect::Lost(reason) => reason,
                    }
                }
                Err(err) => err.to_string(),
            };

            attempt = attempt.saturating_add(1);
            if !self.policy.allows(attempt) {
                warn!(relay = %target, attempt, %reason, "giving up on relay");
                break;
            }
            let delay = self.policy.delay_for(attempt);
            warn!(relay = %target, attempt, ?delay, %reason, "relay connection lost, retrying");
            self.shared.set_state(SyncState::Degraded { reason, attempt });

            tokio::select! {
                () = stopped(&mut self.shutdown) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.set_state(SyncState::Stopped);
        debug!(relay = %target, "sync task finished");
    }

    /// Exchange messages until the connection fails or the session stops
    async fn pump(&mut self, transport: &dyn Transport) -> Disconnect {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let sent = tokio::select! {
                () = stopped(&mut self.shutdown) => return Disconnect::Shutdown,
                queued = self.outbox.recv() => {
                    let Some(first) = queued else {
                        return Disconnect::Shutdown;
                    };
                    let mut changes = vec![first];
                    while let Ok(next) = self.outbox.try_recv() {
                        changes.push(next);
                    }
                    trace!(count = changes.len(), "sending local changes");
                    transport.send(SyncMessage::Changes { changes }).await
                }
                received = transport.recv() => match received {
                    Ok(Some(msg)) => self.handle(transport, msg).await,
                    Ok(None) => return Disconnect::Lost("relay closed the connection".to_string()),
                    Err(err) => Err(err),
                },
                _ = ticker.tick() => transport.send(self.shared.hello()).await,
            };

            if let Err(err) = sent {
                return Disconnect::Lost(err.to_string());
            }
        }
    }

    async fn handle(&self, transport: &dyn Transport, msg: SyncMessage) -> Result<(), TransportError> {
        match msg {
            SyncMessage::Changes { changes } => {
                self.shared.merge_remote(changes);
                Ok(())
            }
            SyncMessage::Welcome {
                state_vector,
                changes,
            } => {
                let missing = self.shared.resync(&state_vector, changes);
                if missing.is_empty() {
                    return Ok(());
                }
                debug!(count = missing.len(), "relay is missing local changes");
                transport.send(SyncMessage::Changes { changes: missing }).await
            }
            SyncMessage::Ping => transport.send(SyncMessage::Pong).await,
            SyncMessage::Pong | SyncMessage::Hello { .. } => {
                trace!(kind = msg.kind(), "ignored");
                Ok(())
            }
        }
    }
}

/// Open a connection and complete the handshake
async fn connect<C: MergeCore>(
    connector: &dyn Connector,
    shared: &Shared<C>,
    outbox: &mut mpsc::UnboundedReceiver<Change>,
    handshake_timeout: Duration,
) -> Result<Box<dyn Transport>, SessionError> {
    let transport = connector.connect().await?;
    transport.send(shared.hello()).await?;

    let (state_vector, changes) =
        tokio::time::timeout(handshake_timeout, await_welcome(transport.as_ref(), shared))
            .await
            .map_err(|_| SessionError::Timeout {
                waited_ms: u64::try_from(handshake_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

    // Everything queued so far is in the replica log
    let mut superseded = 0usize;
    while outbox.try_recv().is_ok() {
        superseded += 1;
    }

    let missing = shared.resync(&state_vector, changes);
    debug!(superseded, resent = missing.len(), "handshake complete");
    if !missing.is_empty() {
        transport.send(SyncMessage::Changes { changes: missing }).await?;
    }

    shared.mark_ready();
    Ok(transport)
}

async fn await_welcome<C: MergeCore>(
    transport: &dyn Transport,
    shared: &Shared<C>,
) -> Result<(CausalContext, Vec<Change>), TransportError> {
    loop {
        match transport.recv().await? {
            Some(SyncMessage::Welcome {
                state_vector,
                changes,
            }) => return Ok((state_vector, changes)),
            Some(SyncMessage::Changes { changes }) => shared.merge_remote(changes),
            Some(SyncMessage::Ping) => transport.send(SyncMessage::Pong).await?,
            Some(other) => trace!(kind = other.kind(), "ignored during handshake"),
            None => return Err(TransportError::Closed),
        }
    }
}

/// Resolves once shutdown is requested or the session handle is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender was dropped
    let _ = shutdown.wait_for(|stop| *stop).await;
}
