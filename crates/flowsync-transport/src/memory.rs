//! In-process relay
//!
//! [`MemoryHub`] runs a [`RelayCore`] inside the current process and hands
//! out [`MemoryTransport`] connections to it. Faults can be injected in both
//! directions: messages may be dropped, duplicated or delayed (which also
//! reorders them), and the hub can be taken offline to force reconnects.

use crate::error::TransportError;
use crate::protocol::SyncMessage;
use crate::relay::{ConnectionId, PeerSink, RelayCore, RelayStats};
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Fault injection settings
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    /// Probability that a message is lost
    pub drop_rate: f64,
    /// Probability that a message is delivered twice
    pub duplicate_rate: f64,
    /// Upper bound of the random delivery delay; zero delivers inline
    pub max_delay: Duration,
    /// Seed for the fault generator
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay: Duration::ZERO,
            seed: 0x5eed,
        }
    }
}

impl FaultConfig {
    /// No faults at all
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Probability that a message is lost
    #[must_use]
    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Probability that a message arrives twice
    #[must_use]
    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Upper bound of the random delivery delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Seed for the fault generator
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// How one message should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Drop,
    Deliver { copies: usize, delay: Duration },
}

#[derive(Debug)]
struct Faults {
    config: Mutex<FaultConfig>,
    rng: Mutex<StdRng>,
}

impl Faults {
    fn new(config: FaultConfig) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config: Mutex::new(config),
        }
    }

    fn plan(&self) -> Plan {
        let config = self.config.lock().clone();
        let mut rng = self.rng.lock();

        if config.drop_rate > 0.0 && rng.random_bool(config.drop_rate) {
            return Plan::Drop;
        }
        let copies = if config.duplicate_rate > 0.0 && rng.random_bool(config.duplicate_rate) {
            2
        } else {
            1
        };
        let delay = if config.max_delay.is_zero() {
            Duration::ZERO
        } else {
            let max = u64::try_from(config.max_delay.as_micros()).unwrap_or(u64::MAX);
            Duration::from_micros(rng.random_range(0..=max))
        };
        Plan::Deliver { copies, delay }
    }

    /// Run `deliver` according to a freshly drawn plan
    fn apply<F>(&self, msg: SyncMessage, deliver: F)
    where
        F: Fn(SyncMessage) + Send + Sync + 'static,
    {
        match self.plan() {
            Plan::Drop => trace!(kind = msg.kind(), "fault: message dropped"),
            Plan::Deliver { copies, delay } if delay.is_zero() => {
                for _ in 0..copies {
                    deliver(msg.clone());
                }
            }
            Plan::Deliver { copies, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for _ in 0..copies {
                        deliver(msg.clone());
                    }
                });
            }
        }
    }
}

/// Relay to client direction, through the fault generator
struct FaultySink {
    tx: mpsc::UnboundedSender<SyncMessage>,
    faults: Arc<Faults>,
}

impl PeerSink for FaultySink {
    fn deliver(&self, msg: SyncMessage) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        let tx = self.tx.clone();
        self.faults.apply(msg, move |m| {
            let _ = tx.send(m);
        });
        true
    }
}

#[derive(Debug)]
struct HubInner {
    relay: RelayCore,
    faults: Arc<Faults>,
    online: AtomicBool,
}

/// In-process relay with fault injection
#[derive(Debug, Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Hub without faults
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(FaultConfig::none())
    }

    /// Hub that injects the given faults
    #[must_use]
    pub fn with_faults(config: FaultConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                relay: RelayCore::new(),
                faults: Arc::new(Faults::new(config)),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Replace the fault settings; the generator is reseeded
    pub fn set_faults(&self, config: FaultConfig) {
        *self.inner.faults.rng.lock() = StdRng::seed_from_u64(config.seed);
        *self.inner.faults.config.lock() = config;
    }

    /// Open a connection
    ///
    /// # Errors
    /// Returns `Unavailable` while the hub is offline
    pub fn connect(&self) -> Result<MemoryTransport, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Unavailable("memory hub is offline".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self.inner.relay.register(FaultySink {
            tx,
            faults: Arc::clone(&self.inner.faults),
        });
        debug!(connection = %conn, "memory connection opened");
        Ok(MemoryTransport {
            conn,
            hub: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Take the hub offline or back online
    ///
    /// Going offline drops every open connection.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if online {
            info!("memory hub online");
        } else {
            let dropped = self.inner.relay.unregister_all();
            info!(dropped, "memory hub offline");
        }
    }

    /// Drop every open connection but keep accepting new ones
    pub fn disconnect_all(&self) -> usize {
        self.inner.relay.unregister_all()
    }

    /// Whether the relay accepts connections
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Relay counters
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.inner.relay.stats()
    }

    /// Connector handing out connections to this hub
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }
}

/// Client end of a memory hub connection
#[derive(Debug)]
pub struct MemoryTransport {
    conn: ConnectionId,
    hub: Arc<HubInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SyncMessage>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Relay-side id of this connection
    #[inline]
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || !self.hub.online.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let hub = Arc::clone(&self.hub);
        let conn = self.conn;
        self.hub.faults.apply(msg, move |m| {
            if let Err(err) = hub.relay.handle(conn, m) {
                trace!(connection = %conn, error = %err, "relay refused message");
            }
        });
        Ok(())
    }

    async fn recv(&self) -> Result<Option<SyncMessage>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.relay.unregister(self.conn);
        }
    }

    fn peer(&self) -> String {
        format!("memory-hub/{}", self.conn)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.relay.unregister(self.conn);
        }
    }
}

/// [`Connector`] for a [`MemoryHub`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

impl MemoryConnector {
    /// Connector for `hub`
    #[must_use]
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.hub.connect()?))
    }

    fn target(&self) -> String {
        "memory-hub".to_string()
    }
}
