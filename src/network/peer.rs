//! Peer connection management
//!
//! Handles individual peer connections, message parsing, and protocol state.

use anyhow::Result;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{TransportAddr, TransportConnection};
use super::NetworkEvent;

/// Peer connection state.
///
/// Speaks through whatever implements `TransportConnection`; the block-
/// propagation core itself never touches a socket directly.
pub struct Peer {
    addr: SocketAddr,
    transport_addr: TransportAddr,
    send_tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: bool,
    /// Connection time (Unix timestamp)
    conntime: u64,
    /// Last send time (Unix timestamp)
    last_send: u64,
    /// Last receive time (Unix timestamp)
    last_recv: u64,
    /// Bytes sent
    bytes_sent: u64,
    /// Bytes received
    bytes_recv: u64,
    /// Connection quality score (0.0-1.0, higher is better). `NetworkManager`
    /// nudges this after every send/receive; nothing in this crate reads it
    /// yet beyond bookkeeping, but peer eviction under load wants it.
    quality_score: f64,
}

impl Peer {
    /// Creates a peer from an already-accepted/connected `TransportConnection`,
    /// spawning the read and write tasks that drive it.
    ///
    /// The read task feeds `events_tx` with `RawMessageReceived` for every
    /// frame and a trailing `PeerDisconnected` once `recv()` signals close or
    /// errors; the write task drains an internal outbound queue (`send_tx`)
    /// until it or the connection closes.
    pub fn from_transport_connection<C: TransportConnection + 'static>(
        conn: C,
        addr: SocketAddr,
        transport_addr: TransportAddr,
        events_tx: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Self {
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        use std::sync::Arc;
        use tokio::sync::Mutex;
        let conn = Arc::new(Mutex::new(conn));
        let conn_read = Arc::clone(&conn);
        let conn_write = Arc::clone(&conn);

        let read_addr = transport_addr.clone();
        let read_events_tx = events_tx.clone();
        tokio::spawn(async move {
            loop {
                let data = {
                    let mut guard = conn_read.lock().await;
                    match guard.recv().await {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(peer = %read_addr, error = %e, "peer read error");
                            break;
                        }
                    }
                };
                if data.is_empty() {
                    break;
                }
                let _ = read_events_tx.send(NetworkEvent::RawMessageReceived(data, read_addr.socket_addr()));
            }
            let _ = read_events_tx.send(NetworkEvent::PeerDisconnected(read_addr));
        });

        let write_addr = transport_addr.clone();
        tokio::spawn(async move {
            while let Some(data) = send_rx.recv().await {
                let mut guard = conn_write.lock().await;
                if let Err(e) = guard.send(&data).await {
                    warn!(peer = %write_addr, error = %e, "peer write error");
                    break;
                }
                debug!(peer = %write_addr, bytes = data.len(), "sent frame");
            }
        });

        let now = now_secs();
        Self {
            addr,
            transport_addr,
            send_tx,
            connected: true,
            conntime: now,
            last_send: now,
            last_recv: now,
            bytes_sent: 0,
            bytes_recv: 0,
            quality_score: 0.5,
        }
    }

    /// Queues a frame for the write task. Non-blocking: delivery failures
    /// surface as a closed channel, which `NetworkManager` treats the same
    /// as a disconnect.
    pub fn send_message(&self, message: Vec<u8>) -> Result<()> {
        self.send_tx
            .send(message)
            .map_err(|e| anyhow::anyhow!("failed to queue message for peer {}: {}", self.addr, e))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn transport_addr(&self) -> &TransportAddr {
        &self.transport_addr
    }

    pub fn quality_score(&self) -> f64 {
        self.quality_score
    }

    /// Records a successful send and nudges the quality score up slightly,
    /// capped at 1.0.
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.last_send = now_secs();
        self.quality_score = (self.quality_score + 0.01).min(1.0);
    }

    /// Records a received frame and nudges the quality score up slightly,
    /// capped at 1.0.
    pub fn record_receive(&mut self, bytes: usize) {
        self.bytes_recv += bytes as u64;
        self.last_recv = now_secs();
        self.quality_score = (self.quality_score + 0.01).min(1.0);
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn last_send(&self) -> u64 {
        self.last_send
    }

    pub fn last_recv(&self) -> u64 {
        self.last_recv
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv
    }

    pub fn conntime(&self) -> u64 {
        self.conntime
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
