//! Transport abstraction layer for network communications
//!
//! The block-propagation core is transport-agnostic: peers are reached
//! through whatever implements `TransportConnection`. This crate ships a
//! TCP implementation (`tcp_transport`); the trait boundary is kept so a
//! QUIC-based transport can be dropped in without touching peer/worker code.

use anyhow::Result;
use std::net::SocketAddr;

/// Transport address for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Tcp(SocketAddr),
}

impl TransportAddr {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(addr) => Some(addr.port()),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(addr) => *addr,
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

impl std::fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddr::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// Transport type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
}

/// Transport trait - abstracts over different network transports.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Connection: TransportConnection + Send;
    type Listener: TransportListener + Send;

    fn transport_type(&self) -> TransportType;
    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener>;
    async fn connect(&self, addr: TransportAddr) -> Result<Self::Connection>;
}

/// Transport connection - abstraction for an active connection.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive data from the peer. `Ok(vec![])` signals a graceful close.
    async fn recv(&mut self) -> Result<Vec<u8>>;

    fn peer_addr(&self) -> TransportAddr;
    fn is_connected(&self) -> bool;
    async fn close(&mut self) -> Result<()>;
}

/// Transport listener - abstraction for accepting incoming connections.
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Connection: TransportConnection + Send;

    async fn accept(&mut self) -> Result<(Self::Connection, TransportAddr)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}
