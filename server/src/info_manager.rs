//! Protocol handlers gluing the session authority to the wire.
//!
//! One manager owns the login, logout and roster flows plus the status
//! broadcasts. Handlers run on pipeline workers and only ever touch the
//! outbound queue; the endpoint's driving thread does the actual sends.

use std::sync::{Arc, Weak};

use log::{debug, warn};

use shared::clock::Clock;
use shared::message::{
    InboundMessage, LogOutRequest, LogOutResponse, LoginRequest, LoginResponse, OutboundMessage,
    PlayerStatusUpdate, ServerInfoRequest, ServerInfoResponse, ServerNotice,
};
use shared::pipeline::OutboundQueue;
use shared::wire::Subject;

use crate::endpoint::ServerEndpoint;
use crate::user_manager::UserManager;

/// Token placeholder in a failed login reply.
const NO_TOKEN: &str = "NoToken";

pub struct ServerInfoManager {
    users: Arc<UserManager>,
    outbound: OutboundQueue,
    clock: Arc<Clock>,
}

impl ServerInfoManager {
    pub fn new(users: Arc<UserManager>, outbound: OutboundQueue, clock: Arc<Clock>) -> Self {
        ServerInfoManager {
            users,
            outbound,
            clock,
        }
    }

    /// Wires every handled subject into the endpoint and installs the
    /// status notifier. The notifier holds a weak reference because the
    /// manager itself keeps the user registry alive.
    pub fn install(self: &Arc<Self>, endpoint: &ServerEndpoint) {
        let subjects: [(Subject, fn(&ServerInfoManager, &InboundMessage)); 5] = [
            (Subject::Connect, ServerInfoManager::handle_connect),
            (Subject::Disconnect, ServerInfoManager::handle_disconnect),
            (Subject::LoginRequest, ServerInfoManager::handle_login),
            (Subject::LogOutRequest, ServerInfoManager::handle_logout),
            (Subject::ServerInfoRequest, ServerInfoManager::handle_server_info),
        ];
        for (subject, handler) in subjects {
            let manager = Arc::clone(self);
            endpoint.register_handler(subject, Arc::new(move |message| handler(&manager, message)));
        }

        let weak: Weak<ServerInfoManager> = Arc::downgrade(self);
        self.users.set_status_notifier(Box::new(move |name, connected| {
            if let Some(manager) = weak.upgrade() {
                manager.broadcast_player_status(name, connected);
            }
        }));
    }

    fn handle_connect(&self, message: &InboundMessage) {
        debug!("peer connected on connection {}", message.connection_id);
    }

    /// Transport-level drop. Tears down whatever session the connection
    /// carried; an unauthenticated peer dropping is a no-op.
    fn handle_disconnect(&self, message: &InboundMessage) {
        if !self.users.disconnect_by_connection(message.connection_id) {
            debug!(
                "connection {} dropped without a session",
                message.connection_id
            );
        }
    }

    fn handle_login(&self, message: &InboundMessage) {
        let request = match LoginRequest::decode(&mut message.payload_reader()) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    "bad login payload from connection {}: {err}",
                    message.connection_id
                );
                return;
            }
        };

        let response = match self.users.connect_user(
            &request.user_id,
            message.connection_id,
            message.host_id,
            message.received_time,
        ) {
            Ok(token) => LoginResponse {
                success: true,
                token,
                detail: format!("Success :: User {} is Connected", request.user_id),
                server_time: self.clock.now(),
            },
            Err(err) => LoginResponse {
                success: false,
                token: NO_TOKEN.to_string(),
                detail: err.to_string(),
                server_time: self.clock.now(),
            },
        };
        self.outbound
            .push(OutboundMessage::reply(response.encode(), message.connection_id));
    }

    fn handle_logout(&self, message: &InboundMessage) {
        let request = match LogOutRequest::decode(&mut message.payload_reader()) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    "bad logout payload from connection {}: {err}",
                    message.connection_id
                );
                return;
            }
        };

        // The token alone authorizes a logout, whichever connection carries
        // the request.
        let success = self.users.disconnect_by_token(&request.token);

        let response = LogOutResponse {
            success,
            detail: if success {
                "User Disconnected Successfully".to_string()
            } else {
                "Error in User Disconnection".to_string()
            },
            server_time: self.clock.now(),
        };
        self.outbound
            .push(OutboundMessage::reply(response.encode(), message.connection_id));
    }

    fn handle_server_info(&self, message: &InboundMessage) {
        let request = match ServerInfoRequest::decode(&mut message.payload_reader()) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    "bad server info payload from connection {}: {err}",
                    message.connection_id
                );
                return;
            }
        };

        let response = match self
            .users
            .lookup_by_token_secure(&request.token, message.connection_id)
        {
            Ok(_) => ServerInfoResponse {
                success: true,
                server_time: self.clock.now(),
                detail: "Success".to_string(),
                user_names: self.users.connected_user_names(),
            },
            Err(err) => ServerInfoResponse {
                success: false,
                server_time: 0.0,
                detail: err.to_string(),
                user_names: Vec::new(),
            },
        };
        self.outbound
            .push(OutboundMessage::reply(response.encode(), message.connection_id));
    }

    fn broadcast_player_status(&self, user_name: &str, connected: bool) {
        let update = PlayerStatusUpdate {
            user_name: user_name.to_string(),
            connected,
            server_time: self.clock.now(),
        };
        self.outbound.push(OutboundMessage::broadcast(update.encode()));
    }

    /// Free-form notice to every connected client.
    pub fn broadcast_notice(&self, text: &str) {
        let notice = ServerNotice {
            text: text.to_string(),
        };
        self.outbound.push(OutboundMessage::broadcast(notice.encode()));
    }
}
