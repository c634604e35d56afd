//! TCP transport
//!
//! A reader task decodes frames into a channel so `recv` stays cancel safe;
//! `send` writes frames directly under a lock.

use crate::codec::{read_frame, write_frame};
use crate::error::TransportError;
use crate::protocol::SyncMessage;
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const INBOUND_CAPACITY: usize = 256;

/// Client connection to a [`RelayServer`](crate::RelayServer)
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<mpsc::Receiver<Result<SyncMessage, TransportError>>>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Connect to a relay
    ///
    /// # Errors
    /// Returns error if the connection cannot be established
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream
    ///
    /// # Errors
    /// Returns error if the peer address is unavailable
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(msg)) => {
                        trace!(%peer, kind = msg.kind(), "frame received");
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(%peer, "relay closed the connection");
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            peer,
            writer: Mutex::new(Some(write_half)),
            inbound: Mutex::new(rx),
            reader,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(TransportError::Closed)?;
        write_frame(half, &msg).await
    }

    async fn recv(&self) -> Result<Option<SyncMessage>, TransportError> {
        self.inbound.lock().await.recv().await.transpose()
    }

    async fn close(&self) {
        if let Some(mut half) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = half.shutdown().await;
        }
        self.reader.abort();
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// [`Connector`] dialing a relay address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connector for `host:port`
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(TcpTransport::connect(&self.addr).await?))
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}
