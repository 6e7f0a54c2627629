//! Tick-driven client endpoint.
//!
//! Mirrors the server's receive/dispatch/send split but talks to exactly one
//! peer. The endpoint never synthesizes connect or disconnect envelopes; it
//! only tracks the link state so the session layer can gate its requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use shared::clock::Clock;
use shared::dispatcher::Handler;
use shared::message::{InboundMessage, OutboundMessage};
use shared::pipeline::{EndpointError, MessagePipeline, OutboundQueue, DEFAULT_WORKER_COUNT};
use shared::transport::{ConnectionId, SocketId, Transport, TransportEvent};
use shared::wire::Subject;
use shared::DEFAULT_MAX_MESSAGES;

struct Link {
    socket: SocketId,
    connection: ConnectionId,
}

pub struct ClientEndpoint {
    transport: Arc<dyn Transport>,
    pipeline: MessagePipeline,
    clock: Arc<Clock>,
    link: Mutex<Option<Link>>,
    connecting: AtomicBool,
    connected: AtomicBool,
    max_messages: u16,
    stopped: AtomicBool,
}

impl ClientEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ClientEndpoint {
            transport,
            pipeline: MessagePipeline::new(),
            clock: Arc::new(Clock::new()),
            link: Mutex::new(None),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            max_messages: DEFAULT_MAX_MESSAGES,
            stopped: AtomicBool::new(false),
        }
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

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Opens an ephemeral socket, starts the dispatch workers and initiates
    /// the connection. The link counts as connecting until the transport
    /// confirms it on a later `listen`.
    pub fn connect(
        &self,
        address: &str,
        port: u16,
        workers: usize,
    ) -> Result<ConnectionId, EndpointError> {
        let socket = self.transport.add_host(0)?;
        self.pipeline.start(workers.max(DEFAULT_WORKER_COUNT), "client")?;
        let connection = match self.transport.connect(socket, address, port) {
            Ok(connection) => connection,
            Err(err) => {
                let _ = self.transport.remove_host(socket);
                return Err(err.into());
            }
        };
        *self.link.lock().unwrap() = Some(Link { socket, connection });
        self.connecting.store(true, Ordering::SeqCst);
        info!("connecting to {address}:{port} as connection {connection}");
        Ok(connection)
    }

    /// One receive pass, bounded like the server's.
    pub fn listen(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let (socket, connection) = {
            let link = self.link.lock().unwrap();
            match &*link {
                Some(link) => (link.socket, link.connection),
                None => return,
            }
        };
        for _ in 0..self.max_messages {
            let event = match self.transport.poll(socket) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    warn!("transport poll failed: {err}");
                    continue;
                }
            };
            match event {
                TransportEvent::Connected(_) => {
                    info!("connection {connection} established");
                    self.connecting.store(false, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                }
                TransportEvent::Data {
                    channel, payload, ..
                } => {
                    if payload.len() < 2 {
                        warn!("runt payload from server, dropped");
                        continue;
                    }
                    let tag = u16::from_be_bytes([payload[0], payload[1]]);
                    let subject = match Subject::from_u16(tag) {
                        Ok(subject) => subject,
                        Err(err) => {
                            warn!("bad payload from server: {err}");
                            continue;
                        }
                    };
                    self.pipeline.push_inbound(InboundMessage::new(
                        connection,
                        socket,
                        channel,
                        subject,
                        payload.slice(2..),
                        self.clock.now(),
                    ));
                }
                TransportEvent::Disconnected(_) => {
                    info!("connection {connection} lost");
                    self.connecting.store(false, Ordering::SeqCst);
                    self.connected.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// One send pass. Everything queued goes to the server connection.
    pub fn send_output_messages(&self) {
        let (socket, connection) = {
            let link = self.link.lock().unwrap();
            match &*link {
                Some(link) => (link.socket, link.connection),
                None => return,
            }
        };
        for _ in 0..self.max_messages {
            let Some(message) = self.pipeline.try_pop_outbound() else {
                break;
            };
            if !self.is_connected() && !self.is_connecting() {
                warn!("dropping outbound message, link is down");
                continue;
            }
            if let Err(err) =
                self.transport
                    .send(socket, connection, message.channel, &message.payload)
            {
                warn!("send to server failed: {err}");
            }
        }
    }

    pub fn add_output_message(&self, message: OutboundMessage) {
        self.pipeline.outbound().push(message);
    }

    /// Joins the workers and closes the socket. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipeline.stop();
        self.connecting.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.lock().unwrap().take() {
            if let Err(err) = self.transport.remove_host(link.socket) {
                debug!("host {} already gone: {err}", link.socket);
            }
        }
        info!("client endpoint stopped");
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::message::ServerNotice;
    use shared::transport::memory::MemoryTransport;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

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
    fn connect_flips_state_once_the_transport_confirms() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_host(9200).unwrap();

        let client = ClientEndpoint::new(Arc::clone(&transport) as Arc<dyn Transport>);
        client.connect("127.0.0.1", 9200, 1).unwrap();
        assert!(client.is_connecting());
        assert!(!client.is_connected());

        client.listen();
        assert!(client.is_connected());
        assert!(!client.is_connecting());
        client.stop();
    }

    #[test]
    fn connect_to_nowhere_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let client = ClientEndpoint::new(Arc::clone(&transport) as Arc<dyn Transport>);
        assert!(client.connect("127.0.0.1", 1, 1).is_err());
        assert!(!client.is_connecting());
    }

    #[test]
    fn inbound_data_reaches_handlers() {
        let transport = Arc::new(MemoryTransport::new());
        let server_socket = transport.add_host(9201).unwrap();

        let client = ClientEndpoint::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        client.register_handler(
            Subject::ServerMessage,
            Arc::new(move |message| {
                let notice = ServerNotice::decode(&mut message.payload_reader()).unwrap();
                assert_eq!(notice.text, "hello");
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );
        client.connect("127.0.0.1", 9201, 1).unwrap();

        // Accept on the server side, then push a notice back.
        let server_conn = loop {
            if let Some(TransportEvent::Connected(id)) = transport.poll(server_socket).unwrap() {
                break id;
            }
        };
        let payload = ServerNotice {
            text: "hello".to_string(),
        }
        .encode();
        transport
            .send(
                server_socket,
                server_conn,
                shared::transport::ChannelKind::Reliable,
                &payload,
            )
            .unwrap();

        client.listen();
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        client.stop();
    }

    #[test]
    fn outbound_messages_reach_the_server() {
        let transport = Arc::new(MemoryTransport::new());
        let server_socket = transport.add_host(9202).unwrap();

        let client = ClientEndpoint::new(Arc::clone(&transport) as Arc<dyn Transport>);
        client.connect("127.0.0.1", 9202, 1).unwrap();
        client.listen();

        client.add_output_message(OutboundMessage::reply(Bytes::from_static(b"up"), 0));
        client.send_output_messages();

        let mut got_data = false;
        while let Some(event) = transport.poll(server_socket).unwrap() {
            if let TransportEvent::Data { payload, .. } = event {
                assert_eq!(&payload[..], b"up");
                got_data = true;
            }
        }
        assert!(got_data);
        client.stop();
    }

    #[test]
    fn sends_without_a_link_are_dropped() {
        let transport = Arc::new(MemoryTransport::new());
        let client = ClientEndpoint::new(Arc::clone(&transport) as Arc<dyn Transport>);
        client.add_output_message(OutboundMessage::reply(Bytes::from_static(b"lost"), 0));
        // No link, so this is a no-op rather than a panic.
        client.send_output_messages();
        client.stop();
    }
}
