//! TCP relay server

use crate::codec::{read_frame, write_frame};
use crate::error::TransportError;
use crate::protocol::SyncMessage;
use crate::relay::{ConnectionId, RelayCore, RelayStats};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay accepting replica connections over TCP
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    core: Arc<RelayCore>,
}

impl RelayServer {
    /// Bind to an address; port `0` picks a free port
    ///
    /// # Errors
    /// Returns error if the address cannot be bound
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            core: Arc::new(RelayCore::new()),
        })
    }

    /// Bound address
    ///
    /// # Errors
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared relay state, for stats
    #[must_use]
    pub fn core(&self) -> Arc<RelayCore> {
        Arc::clone(&self.core)
    }

    /// Counters of the underlying relay core
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.core.stats()
    }

    /// Accept connections until `shutdown` completes
    ///
    /// # Errors
    /// Returns error if the local address is unavailable
    pub async fn run<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(%addr, "relay listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(%addr, "relay shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let core = Arc::clone(&self.core);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(core, stream).await {
                                debug!(%peer, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        let dropped = self.core.unregister_all();
        debug!(dropped, "connections released");
        Ok(())
    }
}

async fn serve_connection(core: Arc<RelayCore>, stream: TcpStream) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (mut read_half, mut write_half) = stream.into_split();

    // Unbounded: a peer that stops reading grows this queue until it disconnects
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();
    let conn = core.register(tx);
    info!(%peer, connection = %conn, "replica connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &msg).await {
                debug!(error = %err, "write to replica failed");
                break;
            }
        }
    });

    let result = read_loop(&core, conn, &mut read_half).await;

    core.unregister(conn);
    writer.abort();
    info!(%peer, connection = %conn, "replica disconnected");
    result
}

async fn read_loop(
    core: &RelayCore,
    conn: ConnectionId,
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<(), TransportError> {
    while let Some(msg) = read_frame(reader).await? {
        match core.handle(conn, msg) {
            Ok(()) => {}
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => warn!(connection = %conn, error = %err, "message rejected"),
        }
    }
    Ok(())
}
