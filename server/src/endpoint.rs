//! Tick-driven server endpoint.
//!
//! The owning thread calls `listen` and `send_output_messages` once per tick.
//! `listen` drains transport events into typed envelopes for the worker pool,
//! `send_output_messages` drains the handlers' replies back out through the
//! transport. Both passes are bounded per call so one busy peer cannot
//! starve the tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use shared::clock::Clock;
use shared::dispatcher::Handler;
use shared::message::{Delivery, InboundMessage, OutboundMessage};
use shared::pipeline::{EndpointError, MessagePipeline, OutboundQueue, DEFAULT_WORKER_COUNT};
use shared::transport::{ConnectionId, SocketId, Transport, TransportEvent};
use shared::wire::Subject;

use crate::user_manager::UserManager;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Per-call cap for both the listen and the send pass.
    pub max_messages: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8888,
            max_messages: 500,
            workers: DEFAULT_WORKER_COUNT,
        }
    }
}

/// Transport-level record of one live peer, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub address: String,
    pub port: u16,
}

pub struct ServerEndpoint {
    transport: Arc<dyn Transport>,
    socket: SocketId,
    users: Arc<UserManager>,
    clock: Arc<Clock>,
    pipeline: MessagePipeline,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    config: ServerConfig,
    stopped: AtomicBool,
}

impl ServerEndpoint {
    /// Hosts the configured port and spawns the dispatch workers. A port
    /// that cannot be hosted is the one fatal startup error.
    pub fn new(
        transport: Arc<dyn Transport>,
        users: Arc<UserManager>,
        config: ServerConfig,
    ) -> Result<Self, EndpointError> {
        let socket = transport.add_host(config.port)?;
        let pipeline = MessagePipeline::new();
        pipeline.start(config.workers, "server")?;
        info!("server hosting port {} on socket {socket}", config.port);
        Ok(ServerEndpoint {
            transport,
            socket,
            users,
            clock: Arc::new(Clock::new()),
            pipeline,
            connections: Mutex::new(HashMap::new()),
            config,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn register_handler(&self, subject: Subject, handler: Handler) {
        self.pipeline.register_handler(subject, handler);
    }

    pub fn remove_handler(&self, subject: Subject, handler: &Handler) -> bool {
        self.pipeline.remove_handler(subject, handler)
    }

    pub fn outbound(&self) -> OutboundQueue {
        self.pipeline.outbound()
    }

    pub fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.clock)
    }

    pub fn users(&self) -> Arc<UserManager> {
        Arc::clone(&self.users)
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections.lock().unwrap().get(&connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// One receive pass. Polls the transport until it runs dry or the
    /// per-call cap is hit, converting each event into an envelope for the
    /// workers. A malformed payload or a poll error is logged and skipped;
    /// the pass keeps going.
    pub fn listen(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.config.max_messages {
            let event = match self.transport.poll(self.socket) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    warn!("transport poll failed: {err}");
                    continue;
                }
            };
            match event {
                TransportEvent::Connected(connection_id) => {
                    let (address, port) = match self
                        .transport
                        .connection_info(self.socket, connection_id)
                    {
                        Ok(info) => info,
                        Err(err) => {
                            warn!("no connection info for {connection_id}: {err}");
                            (String::new(), 0)
                        }
                    };
                    info!("connection {connection_id} opened from {address}:{port}");
                    self.connections.lock().unwrap().insert(
                        connection_id,
                        Connection {
                            connection_id,
                            address,
                            port,
                        },
                    );
                    self.pipeline.push_inbound(InboundMessage::control(
                        connection_id,
                        self.socket,
                        Subject::Connect,
                        self.clock.now(),
                    ));
                }
                TransportEvent::Data {
                    connection,
                    channel,
                    payload,
                } => {
                    if payload.len() < 2 {
                        warn!("runt payload from connection {connection}, dropped");
                        continue;
                    }
                    let tag = u16::from_be_bytes([payload[0], payload[1]]);
                    let subject = match Subject::from_u16(tag) {
                        Ok(subject) => subject,
                        Err(err) => {
                            warn!("bad payload from connection {connection}: {err}");
                            continue;
                        }
                    };
                    self.pipeline.push_inbound(InboundMessage::new(
                        connection,
                        self.socket,
                        channel,
                        subject,
                        payload.slice(2..),
                        self.clock.now(),
                    ));
                }
                TransportEvent::Disconnected(connection_id) => {
                    info!("connection {connection_id} closed");
                    self.connections.lock().unwrap().remove(&connection_id);
                    self.pipeline.push_inbound(InboundMessage::control(
                        connection_id,
                        self.socket,
                        Subject::Disconnect,
                        self.clock.now(),
                    ));
                }
            }
        }
    }

    /// One send pass. Drains queued replies and broadcasts up to the
    /// per-call cap, where a broadcast costs one unit per destination. A
    /// failed send is logged per destination and never aborts the rest of
    /// the pass.
    pub fn send_output_messages(&self) {
        let mut budget = self.config.max_messages as usize;
        while budget > 0 {
            let Some(message) = self.pipeline.try_pop_outbound() else {
                break;
            };
            match message.delivery {
                Delivery::Reply(connection_id) => {
                    self.send_to(connection_id, &message);
                    budget -= 1;
                }
                Delivery::Broadcast => {
                    // Snapshot of the authenticated peers; a peer that drops
                    // mid-pass just logs on its own send. A popped broadcast
                    // always finishes its fan-out, even over budget.
                    for connection_id in self.users.connected_connection_ids() {
                        self.send_to(connection_id, &message);
                        budget = budget.saturating_sub(1);
                    }
                }
            }
        }
    }

    fn send_to(&self, connection_id: ConnectionId, message: &OutboundMessage) {
        if let Err(err) =
            self.transport
                .send(self.socket, connection_id, message.channel, &message.payload)
        {
            warn!("send to connection {connection_id} failed: {err}");
        }
    }

    /// Shuts the endpoint down: joins the workers after they drain the
    /// inbound queue, then tears the hosted socket down. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipeline.stop();
        if let Err(err) = self.transport.remove_host(self.socket) {
            debug!("host {} already gone: {err}", self.socket);
        }
        info!("server endpoint stopped");
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::message::LoginRequest;
    use shared::transport::memory::MemoryTransport;
    use shared::transport::ChannelKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn endpoint_on(transport: &Arc<MemoryTransport>, port: u16) -> ServerEndpoint {
        let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
        ServerEndpoint::new(
            transport,
            Arc::new(UserManager::new()),
            ServerConfig {
                port,
                max_messages: 50,
                workers: 1,
            },
        )
        .unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn connect_event_becomes_a_control_envelope() {
        let transport = Arc::new(MemoryTransport::new());
        let server = endpoint_on(&transport, 9100);

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        server.register_handler(
            Subject::Connect,
            Arc::new(move |message| {
                assert_eq!(message.payload_reader().remaining(), 0);
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let client_socket = transport.add_host(0).unwrap();
        transport.connect(client_socket, "127.0.0.1", 9100).unwrap();
        server.listen();

        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        assert_eq!(server.connection_count(), 1);
        server.stop();
    }

    #[test]
    fn data_payloads_are_decoded_and_dispatched() {
        let transport = Arc::new(MemoryTransport::new());
        let server = endpoint_on(&transport, 9101);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.register_handler(
            Subject::LoginRequest,
            Arc::new(move |message| {
                let request = LoginRequest::decode(&mut message.payload_reader()).unwrap();
                sink.lock().unwrap().push(request.user_id);
            }),
        );

        let client_socket = transport.add_host(0).unwrap();
        let connection = transport.connect(client_socket, "127.0.0.1", 9101).unwrap();
        let payload = LoginRequest {
            user_id: "u1".to_string(),
        }
        .encode();
        transport
            .send(client_socket, connection, ChannelKind::Reliable, &payload)
            .unwrap();
        server.listen();

        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        assert_eq!(seen.lock().unwrap()[0], "u1");
        server.stop();
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let transport = Arc::new(MemoryTransport::new());
        let server = endpoint_on(&transport, 9102);

        let hits = Arc::new(AtomicUsize::new(0));
        for subject in [Subject::Connect, Subject::LoginRequest] {
            let counted = Arc::clone(&hits);
            server.register_handler(
                subject,
                Arc::new(move |_| {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let client_socket = transport.add_host(0).unwrap();
        let connection = transport.connect(client_socket, "127.0.0.1", 9102).unwrap();
        // Unknown tag, then a runt.
        transport
            .send(client_socket, connection, ChannelKind::Reliable, &[0xff, 0xff, 1])
            .unwrap();
        transport
            .send(client_socket, connection, ChannelKind::Reliable, &[0])
            .unwrap();
        server.listen();

        // Only the synthesized connect envelope reaches a handler.
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.stop();
    }

    #[test]
    fn reply_reaches_only_its_target() {
        let transport = Arc::new(MemoryTransport::new());
        let server = endpoint_on(&transport, 9103);

        let client_socket = transport.add_host(0).unwrap();
        transport.connect(client_socket, "127.0.0.1", 9103).unwrap();
        server.listen();
        assert!(wait_for(|| server.connection_count() == 1));
        let server_side = server
            .connections
            .lock()
            .unwrap()
            .keys()
            .copied()
            .next()
            .unwrap();

        server.outbound().push(OutboundMessage::reply(
            bytes::Bytes::from_static(b"pong"),
            server_side,
        ));
        server.send_output_messages();

        // Drain the client's connect ack first.
        assert!(wait_for(|| {
            matches!(
                transport.poll(client_socket),
                Ok(Some(TransportEvent::Data { ref payload, .. })) if &payload[..] == b"pong"
            )
        }));
        server.stop();
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let server = endpoint_on(&transport, 9104);
        server.stop();
        server.stop();
        // The port is free again for the next host.
        assert!(transport.add_host(9104).is_ok());
    }
}
