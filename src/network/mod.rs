//! Networking: wires TCP peer connections to `node::NodeState`.
//!
//! `NetworkManager` is the only piece of this crate that touches a socket.
//! It accepts connections, frames/deframes the wire protocol via
//! `protocol::ProtocolParser`, and turns each `ProtocolMessage` into the
//! matching `NodeState::on_*` call. Everything `NodeState` hands back is a
//! `Vec<node::PeerAction>`, which this module turns into queued sends or
//! disconnects - the decision logic itself never touches a socket.

pub mod announce;
pub mod compact_blocks;
pub mod dos_protection;
pub mod errors;
pub mod header_processor;
pub mod in_flight;
pub mod mempool_index;
pub mod peer;
pub mod peer_state;
pub mod peer_worker;
pub mod protocol;
pub mod reconstruction;
pub mod short_id;
pub mod tcp_transport;
pub mod thin_block_builder;
pub mod thin_tx;
pub mod transport;
pub mod txhash;
pub mod varint;

use crate::config::RelayConfig;
use crate::domain::ChainView;
use crate::network::dos_protection::DosProtectionManager;
use crate::network::peer::Peer;
use crate::network::protocol::{ProtocolMessage, ProtocolParser, MSG_BLOCK};
use crate::network::tcp_transport::TcpTransport;
use crate::network::transport::{Transport, TransportAddr, TransportListener};
use crate::node::{NodeState, PeerAction};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything a connection's read/write tasks hand back to the manager's
/// single event loop.
#[derive(Debug)]
pub enum NetworkEvent {
    PeerConnected(TransportAddr),
    PeerDisconnected(TransportAddr),
    RawMessageReceived(Vec<u8>, SocketAddr),
}

/// How often the stall-check sweep runs, independent of the configured
/// stalling timeout so a short timeout in tests doesn't turn into a busy
/// loop.
const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Owns the accepted TCP connections and ties their wire traffic to a
/// `NodeState`. One `NetworkManager` per listening node; peers are keyed by
/// their socket address's string form, which also doubles as the
/// `node::NodeState` peer id.
pub struct NetworkManager<C: ChainView + Send + 'static> {
    config: RelayConfig,
    node: Arc<NodeState<C>>,
    transport: TcpTransport,
    dos: DosProtectionManager,
    peers: Mutex<HashMap<String, Peer>>,
}

impl<C: ChainView + Send + 'static> NetworkManager<C> {
    pub fn new(config: RelayConfig, node: Arc<NodeState<C>>) -> Self {
        let dos = DosProtectionManager::with_ban_settings(
            20,
            60,
            10_000,
            config.max_peers,
            3,
            config.ban_duration.as_secs(),
        );
        NetworkManager { config, node, transport: TcpTransport::new(), dos, peers: Mutex::new(HashMap::new()) }
    }

    /// Binds `listen_addr` and runs until the process exits: an accept loop
    /// feeding new peers into the shared event channel, a periodic stall
    /// sweep, and the event loop itself dispatching wire
    /// messages into `NodeState`.
    pub async fn run(self: Arc<Self>, listen_addr: SocketAddr) -> anyhow::Result<()> {
        let mut listener = self.transport.listen(listen_addr).await?;
        info!(%listen_addr, "listening for peers");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<NetworkEvent>();

        let accept_mgr = Arc::clone(&self);
        let accept_tx = events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, transport_addr)) => {
                        accept_mgr.clone().accept_connection(conn, transport_addr, accept_tx.clone());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        let stall_mgr = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALL_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                let actions = stall_mgr.node.check_stalls(Instant::now());
                stall_mgr.apply_actions(actions).await;
            }
        });

        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        Ok(())
    }

    /// Outbound connect, for a node that also dials peers rather than only
    /// accepting them. Shares the caller's event channel so both directions
    /// feed the same dispatch loop.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        events_tx: mpsc::UnboundedSender<NetworkEvent>,
    ) -> anyhow::Result<()> {
        let conn = self.transport.connect(TransportAddr::Tcp(addr)).await?;
        Arc::clone(self).accept_connection(conn, TransportAddr::Tcp(addr), events_tx);
        Ok(())
    }

    fn accept_connection<Conn: transport::TransportConnection + 'static>(
        self: Arc<Self>,
        conn: Conn,
        transport_addr: TransportAddr,
        events_tx: mpsc::UnboundedSender<NetworkEvent>,
    ) {
        let socket_addr = transport_addr.socket_addr();
        tokio::spawn(async move {
            if !self.dos.check_connection(socket_addr.ip()).await {
                warn!(%socket_addr, "connection rejected: rate limit");
                return;
            }
            let peer_count = self.peers.lock().unwrap().len();
            if !self.dos.check_active_connections(peer_count).await {
                warn!(%socket_addr, "connection rejected: active connection limit");
                return;
            }

            let peer_id = socket_addr.to_string();
            let peer = Peer::from_transport_connection(conn, socket_addr, transport_addr.clone(), events_tx.clone());
            self.peers.lock().unwrap().insert(peer_id.clone(), peer);
            self.node.add_peer(peer_id.clone());
            info!(%peer_id, "peer connected");
            let _ = events_tx.send(NetworkEvent::PeerConnected(transport_addr));
        });
    }

    async fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(_) => {}
            NetworkEvent::PeerDisconnected(addr) => {
                let peer_id = addr.socket_addr().to_string();
                self.peers.lock().unwrap().remove(&peer_id);
                self.node.remove_peer(&peer_id);
                info!(%peer_id, "peer disconnected");
            }
            NetworkEvent::RawMessageReceived(data, addr) => {
                let peer_id = addr.to_string();
                if let Some(peer) = self.peers.lock().unwrap().get_mut(&peer_id) {
                    peer.record_receive(data.len());
                }
                let actions = self.dispatch(&peer_id, &data);
                self.apply_actions(actions).await;
            }
        }
    }

    /// Parses one wire frame and routes it to the matching `NodeState`
    /// method. Parse failures are logged and dropped rather than
    /// misbehavior-scored - they aren't necessarily the peer's fault.
    fn dispatch(&self, peer_id: &str, data: &[u8]) -> Vec<PeerAction> {
        let message = match ProtocolParser::parse_message(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(%peer_id, error = %e, "failed to parse wire message");
                return Vec::new();
            }
        };

        match message {
            ProtocolMessage::Inv(inv) => inv
                .inventory
                .into_iter()
                .filter(|item| item.inv_type == MSG_BLOCK)
                .flat_map(|item| self.node.on_block_inv(peer_id, item.hash))
                .collect(),
            ProtocolMessage::GetHeaders(msg) => {
                self.node.on_get_headers(peer_id, msg.block_locator_hashes, msg.hash_stop)
            }
            ProtocolMessage::Headers(msg) => {
                let peer_sent_max = msg.headers.len() as u32 >= self.config.max_headers_results;
                self.node.on_headers(peer_id, msg.headers, peer_sent_max)
            }
            ProtocolMessage::GetData(msg) => self.node.on_get_data(peer_id, msg.inventory),
            ProtocolMessage::Block(msg) => self.node.on_block(peer_id, msg.block),
            ProtocolMessage::CmpctBlock(msg) => self.node.on_compact_block(peer_id, msg.compact_block),
            ProtocolMessage::GetBlockTxn(msg) => self.node.on_get_block_txn(peer_id, msg.block_hash, msg.indices),
            ProtocolMessage::BlockTxn(msg) => self.node.on_block_txn(peer_id, msg),
            ProtocolMessage::GetXThin(_) => self.node.on_get_xthin(peer_id),
            ProtocolMessage::XThinBlock(msg) => self.node.on_xthin_block(peer_id, msg.xthin_block),
            ProtocolMessage::GetXBlockTx(msg) => self.node.on_get_xblock_tx(peer_id, msg.block_hash, msg.cheap_hashes),
            ProtocolMessage::XBlockTx(msg) => self.node.on_xblock_tx(peer_id, msg),
            ProtocolMessage::SendCmpct(msg) => self.node.on_send_cmpct(peer_id, msg),
            ProtocolMessage::Reject(msg) => {
                debug!(%peer_id, command = %msg.command, reason = %msg.reason, "peer rejected our message");
                Vec::new()
            }
        }
    }

    async fn apply_actions(&self, actions: Vec<PeerAction>) {
        for action in actions {
            match action {
                PeerAction::SendTo(peer_id, message) => self.send_to(&peer_id, &message),
                PeerAction::Disconnect(peer_id) => self.disconnect(&peer_id),
            }
        }
    }

    fn send_to(&self, peer_id: &str, message: &ProtocolMessage) {
        let bytes = match ProtocolParser::serialize_message(message) {
            Ok(b) => b,
            Err(e) => {
                warn!(%peer_id, error = %e, "failed to serialize outbound message");
                return;
            }
        };
        let len = bytes.len();
        let mut peers = self.peers.lock().unwrap();
        let Some(peer) = peers.get_mut(peer_id) else {
            debug!(%peer_id, "dropping outbound message to unknown/disconnected peer");
            return;
        };
        if let Err(e) = peer.send_message(bytes) {
            warn!(%peer_id, error = %e, "failed to queue outbound message");
            return;
        }
        peer.record_send(len);
    }

    fn disconnect(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.lock().unwrap().remove(peer_id) {
            peer.mark_disconnected();
        }
        self.node.remove_peer(peer_id);
        info!(%peer_id, "peer disconnected by policy");
    }
}
