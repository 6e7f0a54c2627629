//! In-process transport: hosts keyed by port, linked by paired connection
//! records, events delivered through per-host inboxes. Deterministic, which
//! makes it the transport of choice for tests and single-process demos.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;

use super::{ChannelKind, ConnectionId, SocketId, Transport, TransportError, TransportEvent};

struct Peer {
    remote_socket: SocketId,
    remote_connection: ConnectionId,
}

struct Host {
    port: u16,
    inbox: VecDeque<TransportEvent>,
    peers: HashMap<ConnectionId, Peer>,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<SocketId, Host>,
    next_socket: SocketId,
    next_connection: ConnectionId,
}

impl Inner {
    fn port_taken(&self, port: u16) -> bool {
        self.hosts.values().any(|host| host.port == port)
    }
}

/// Shared hub. Hand the same `Arc<MemoryTransport>` to every endpoint that
/// should be able to reach the others.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }
}

impl Transport for MemoryTransport {
    fn add_host(&self, port: u16) -> Result<SocketId, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let port = if port == 0 {
            // Ephemeral hosts take the highest free port.
            let mut candidate = u16::MAX;
            while inner.port_taken(candidate) {
                candidate = candidate
                    .checked_sub(1)
                    .ok_or(TransportError::PortInUse(0))?;
            }
            candidate
        } else {
            if inner.port_taken(port) {
                return Err(TransportError::PortInUse(port));
            }
            port
        };
        inner.next_socket += 1;
        let socket = inner.next_socket;
        inner.hosts.insert(
            socket,
            Host {
                port,
                inbox: VecDeque::new(),
                peers: HashMap::new(),
            },
        );
        Ok(socket)
    }

    fn connect(
        &self,
        socket: SocketId,
        address: &str,
        port: u16,
    ) -> Result<ConnectionId, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.hosts.contains_key(&socket) {
            return Err(TransportError::UnknownHost(socket));
        }
        let target = inner
            .hosts
            .iter()
            .find(|(id, host)| **id != socket && host.port == port)
            .map(|(id, _)| *id)
            .ok_or_else(|| TransportError::Unreachable(address.to_string(), port))?;

        inner.next_connection += 1;
        let local = inner.next_connection;
        inner.next_connection += 1;
        let remote = inner.next_connection;

        if let Some(host) = inner.hosts.get_mut(&socket) {
            host.peers.insert(
                local,
                Peer {
                    remote_socket: target,
                    remote_connection: remote,
                },
            );
            host.inbox.push_back(TransportEvent::Connected(local));
        }
        if let Some(host) = inner.hosts.get_mut(&target) {
            host.peers.insert(
                remote,
                Peer {
                    remote_socket: socket,
                    remote_connection: local,
                },
            );
            host.inbox.push_back(TransportEvent::Connected(remote));
        }
        Ok(local)
    }

    fn poll(&self, socket: SocketId) -> Result<Option<TransportEvent>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get_mut(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        Ok(host.inbox.pop_front())
    }

    fn send(
        &self,
        socket: SocketId,
        connection: ConnectionId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .get(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        let peer = host
            .peers
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        let (remote_socket, remote_connection) = (peer.remote_socket, peer.remote_connection);
        let remote = inner
            .hosts
            .get_mut(&remote_socket)
            .ok_or(TransportError::UnknownConnection(connection))?;
        remote.inbox.push_back(TransportEvent::Data {
            connection: remote_connection,
            channel,
            payload: Bytes::copy_from_slice(payload),
        });
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
        let peer = host
            .peers
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        let port = inner
            .hosts
            .get(&peer.remote_socket)
            .map(|remote| remote.port)
            .unwrap_or(0);
        Ok(("memory".to_string(), port))
    }

    fn remove_host(&self, socket: SocketId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let host = inner
            .hosts
            .remove(&socket)
            .ok_or(TransportError::UnknownHost(socket))?;
        for peer in host.peers.values() {
            if let Some(remote) = inner.hosts.get_mut(&peer.remote_socket) {
                remote.peers.remove(&peer.remote_connection);
                remote
                    .inbox
                    .push_back(TransportEvent::Disconnected(peer.remote_connection));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_links_both_sides() {
        let transport = MemoryTransport::new();
        let server = transport.add_host(9000).unwrap();
        let client = transport.add_host(0).unwrap();

        let conn = transport.connect(client, "memory", 9000).unwrap();

        match transport.poll(client).unwrap() {
            Some(TransportEvent::Connected(id)) => assert_eq!(id, conn),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            transport.poll(server).unwrap(),
            Some(TransportEvent::Connected(_))
        ));
        assert!(transport.poll(server).unwrap().is_none());
    }

    #[test]
    fn data_reaches_the_peer_inbox() {
        let transport = MemoryTransport::new();
        let server = transport.add_host(9000).unwrap();
        let client = transport.add_host(0).unwrap();
        let conn = transport.connect(client, "memory", 9000).unwrap();
        transport.poll(client).unwrap();
        transport.poll(server).unwrap();

        transport
            .send(client, conn, ChannelKind::Reliable, b"ping")
            .unwrap();

        match transport.poll(server).unwrap() {
            Some(TransportEvent::Data {
                channel, payload, ..
            }) => {
                assert_eq!(channel, ChannelKind::Reliable);
                assert_eq!(&payload[..], b"ping");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn remove_host_disconnects_peers() {
        let transport = MemoryTransport::new();
        let server = transport.add_host(9000).unwrap();
        let client = transport.add_host(0).unwrap();
        transport.connect(client, "memory", 9000).unwrap();
        transport.poll(client).unwrap();
        let server_conn = match transport.poll(server).unwrap() {
            Some(TransportEvent::Connected(id)) => id,
            other => panic!("unexpected event {other:?}"),
        };

        transport.remove_host(client).unwrap();

        match transport.poll(server).unwrap() {
            Some(TransportEvent::Disconnected(id)) => assert_eq!(id, server_conn),
            other => panic!("unexpected event {other:?}"),
        }
        // The dead link is gone on the surviving side too.
        assert!(transport
            .send(server, server_conn, ChannelKind::Reliable, b"x")
            .is_err());
    }

    #[test]
    fn ephemeral_ports_never_collide_with_hosted_ones() {
        let transport = MemoryTransport::new();
        transport.add_host(u16::MAX).unwrap();
        transport.add_host(u16::MAX - 1).unwrap();
        transport.add_host(0).unwrap();
        transport.add_host(0).unwrap();

        let inner = transport.inner.lock().unwrap();
        let mut ports: Vec<u16> = inner.hosts.values().map(|host| host.port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }

    #[test]
    fn connect_to_unhosted_port_fails() {
        let transport = MemoryTransport::new();
        let client = transport.add_host(0).unwrap();
        assert!(matches!(
            transport.connect(client, "memory", 4242),
            Err(TransportError::Unreachable(_, 4242))
        ));
    }

    #[test]
    fn duplicate_port_is_refused() {
        let transport = MemoryTransport::new();
        transport.add_host(9000).unwrap();
        assert!(matches!(
            transport.add_host(9000),
            Err(TransportError::PortInUse(9000))
        ));
    }
}
