//! Non-blocking UDP adapter for the transport contract.
//!
//! Frames carry a 1-byte kind (connect request / accept / data / close); data
//! frames add a 1-byte channel id before the payload. The channel class is
//! carried end to end but both classes share the socket: this adapter offers
//! datagram delivery only and implements no retransmission or ordering.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

use bytes::Bytes;
use log::debug;

use super::{ChannelKind, ConnectionId, SocketId, Transport, TransportError, TransportEvent};

const FRAME_CONNECT: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_DATA: u8 = 3;
const FRAME_CLOSE: u8 = 4;

const MAX_DATAGRAM: usize = 1536;

struct Host {
    socket: UdpSocket,
    peers: HashMap<ConnectionId, SocketAddr>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_connection: ConnectionId,
}

impl Host {
    fn register(&mut self, addr: SocketAddr) -> ConnectionId {
        self.next_connection += 1;
        let connection = self.next_connection;
        self.peers.insert(connection, addr);
        self.by_addr.insert(addr, connection);
        connection
    }

    fn unregister(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        let connection = self.by_addr.remove(&addr)?;
        self.peers.remove(&connection);
        Some(connection)
    }
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<SocketId, Host>,
    next_socket: SocketId,
}

#[derive(Default)]
pub struct UdpTransport {
    inner: Mutex<Inner>,
}

impl UdpTransport {
    pub fn new() -> Self {
        UdpTransport::default()
    }

    fn resolve(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
        (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Unreachable(address.to_string(), port))
    }
}

impl Transport for UdpTransport {
    fn add_host(&self, port: u16) -> Result<SocketId, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|err| {
            if err.kind() == ErrorKind::AddrInUse {
                TransportError::PortInUse(port)
            } else {
                TransportError::Io(err)
            }
        })?;
        socket.set_nonblocking(true)?;

        let mut inner = self.inner.lock().unwrap();
        inner.next_socket += 1;
        let id = inner.next_socket;
        inner.hosts.insert(
            id,
            Host {
                socket,
                peers: HashMap::new(),
                by_addr: HashMap::new(),
                next_connection: 0,
            },
        );
        Ok(id)
    }

    fn connect(
        &self,
        socket: SocketId,
        address: &str,
        port: u16,
    ) -> Result<ConnectionId, TransportError> {
        let addr = Self::resolve(address, port)?;
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get_mut(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        let connection = host.register(addr);
        host.socket.send_to(&[FRAME_CONNECT], addr)?;
        Ok(connection)
    }

    fn poll(&self, socket: SocketId) -> Result<Option<TransportEvent>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get_mut(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        // Skip over junk datagrams until there is a real event or the socket
        // runs dry.
        loop {
            let (len, addr) = match host.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            if len == 0 {
                continue;
            }
            match buf[0] {
                FRAME_CONNECT => {
                    if let Some(existing) = host.by_addr.get(&addr) {
                        // Duplicate hello; re-accept and keep the connection.
                        debug!("duplicate connect from {addr} (connection {existing})");
                        host.socket.send_to(&[FRAME_ACCEPT], addr)?;
                        continue;
                    }
                    let connection = host.register(addr);
                    host.socket.send_to(&[FRAME_ACCEPT], addr)?;
                    return Ok(Some(TransportEvent::Connected(connection)));
                }
                FRAME_ACCEPT => match host.by_addr.get(&addr) {
                    Some(connection) => return Ok(Some(TransportEvent::Connected(*connection))),
                    None => continue,
                },
                FRAME_DATA => {
                    let Some(connection) = host.by_addr.get(&addr).copied() else {
                        debug!("data from unknown peer {addr}, dropping");
                        continue;
                    };
                    if len < 2 {
                        continue;
                    }
                    let channel =
                        ChannelKind::from_u8(buf[1]).unwrap_or(ChannelKind::Reliable);
                    return Ok(Some(TransportEvent::Data {
                        connection,
                        channel,
                        payload: Bytes::copy_from_slice(&buf[2..len]),
                    }));
                }
                FRAME_CLOSE => match host.unregister(addr) {
                    Some(connection) => return Ok(Some(TransportEvent::Disconnected(connection))),
                    None => continue,
                },
                _ => continue,
            }
        }
    }

    fn send(
        &self,
        socket: SocketId,
        connection: ConnectionId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        let addr = host
            .peers
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(FRAME_DATA);
        frame.push(channel.as_u8());
        frame.extend_from_slice(payload);
        host.socket.send_to(&frame, addr)?;
        Ok(())
    }

    fn connection_info(
        &self,
        socket: SocketId,
        connection: ConnectionId,
    ) -> Result<(String, u16), TransportError> {
        let inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        let addr = host
            .peers
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        Ok((addr.ip().to_string(), addr.port()))
    }

    fn remove_host(&self, socket: SocketId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .remove(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        for addr in host.peers.values() {
            // Best effort: the peer times nothing out, it just learns early.
            let _ = host.socket.send_to(&[FRAME_CLOSE], addr);
        }
        Ok(())
    }
}
