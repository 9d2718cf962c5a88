//! Datagram transport seams.
//!
//! Publishers write through a [`ChunkSink`]; subscribers read from an
//! `mpsc::Receiver<Bytes>` fed by [`udp_pump`] or by an in-memory sender.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use driftnet_core::wire::MAX_DATAGRAM;

/// Something that can carry one encoded chunk to the other side.
///
/// `WouldBlock`, `Interrupted`, `TimedOut`, `ConnectionRefused` and
/// `OutOfMemory` errors are treated as transient by the publisher.
pub trait ChunkSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Sends every datagram to a fixed peer.
#[derive(Debug, Clone)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// Bind an ephemeral local socket matching the peer's address family.
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::new(Arc::new(socket), peer))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl ChunkSink for UdpSink {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(datagram, self.peer).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {sent} of {} bytes", datagram.len()),
            ));
        }
        Ok(())
    }
}

/// In-memory sink. A full channel reports `WouldBlock` so the publisher
/// backs off; a closed one reports `BrokenPipe`.
impl ChunkSink for mpsc::Sender<Bytes> {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        self.try_send(Bytes::copy_from_slice(datagram))
            .map_err(|e| match e {
                TrySendError::Full(_) => io::Error::from(io::ErrorKind::WouldBlock),
                TrySendError::Closed(_) => io::Error::from(io::ErrorKind::BrokenPipe),
            })
    }
}

/// Read datagrams from `socket` into `tx` until shutdown or until the
/// receiving side goes away.
pub async fn udp_pump(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    // One spare byte so an oversized datagram shows up as too long rather
    // than silently truncated to a valid-looking length.
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("udp pump shutting down");
                return Ok(());
            }

            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(r) => r,
                    // ICMP port unreachable from an earlier send surfaces here on some platforms.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        tracing::trace!(error = %e, "ignoring connection reset");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                tracing::trace!(%from, len, "datagram received");

                if tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                    tracing::info!("subscriber dropped, udp pump exiting");
                    return Ok(());
                }
            }
        }
    }
}
