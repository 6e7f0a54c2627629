//! Poll-style transport contract.
//!
//! The endpoints only require a collaborator that can host a socket, open
//! connections, surface one event per poll and push byte payloads on a
//! channel. Connection establishment, QoS and packet framing stay on the
//! transport's side of this boundary.

use bytes::Bytes;
use thiserror::Error;

pub mod memory;
pub mod udp;

/// Handle to one hosted socket.
pub type SocketId = u32;
/// Handle to one live peer on a socket. Only meaningful host-locally.
pub type ConnectionId = u32;

/// Delivery class for an outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Delivered in order, retried on loss.
    Reliable,
    /// Fire-and-forget.
    Unreliable,
}

impl ChannelKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ChannelKind::Reliable => 0,
            ChannelKind::Unreliable => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<ChannelKind> {
        match raw {
            0 => Some(ChannelKind::Reliable),
            1 => Some(ChannelKind::Unreliable),
            _ => None,
        }
    }
}

/// One event surfaced by a poll. `poll` returning `Ok(None)` means nothing
/// is pending this tick.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Data {
        connection: ConnectionId,
        channel: ChannelKind,
        payload: Bytes,
    },
    Disconnected(ConnectionId),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no host with socket id {0}")]
    UnknownHost(SocketId),
    #[error("no connection {0} on this host")]
    UnknownConnection(ConnectionId),
    #[error("port {0} is already hosted")]
    PortInUse(u16),
    #[error("no host reachable at {0}:{1}")]
    Unreachable(String, u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The transport collaborator. Implementations must be callable from the
/// driving thread and the worker threads concurrently.
pub trait Transport: Send + Sync {
    /// Opens a hosted socket. Port 0 requests an ephemeral port.
    fn add_host(&self, port: u16) -> Result<SocketId, TransportError>;

    /// Initiates an outgoing connection. The returned id is live immediately
    /// for sends; the `Connected` event confirms the remote side accepted.
    fn connect(
        &self,
        socket: SocketId,
        address: &str,
        port: u16,
    ) -> Result<ConnectionId, TransportError>;

    /// Surfaces at most one pending event.
    fn poll(&self, socket: SocketId) -> Result<Option<TransportEvent>, TransportError>;

    fn send(
        &self,
        socket: SocketId,
        connection: ConnectionId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Remote address and port of a live connection, for diagnostics.
    fn connection_info(
        &self,
        socket: SocketId,
        connection: ConnectionId,
    ) -> Result<(String, u16), TransportError>;

    /// Tears the socket down, disconnecting every live peer.
    fn remove_host(&self, socket: SocketId) -> Result<(), TransportError>;
}
