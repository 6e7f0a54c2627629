//! Client-side session state machine.
//!
//! Wraps the endpoint with the login/logout/roster protocol: requests go out
//! through the outbound queue, responses update a shared snapshot the
//! embedding application reads between ticks.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use shared::message::{
    LogOutRequest, LogOutResponse, LoginRequest, LoginResponse, OutboundMessage,
    PlayerStatusUpdate, ServerInfoRequest, ServerInfoResponse, ServerNotice,
};
use shared::wire::Subject;

use crate::endpoint::ClientEndpoint;

/// Snapshot of the session as last reported by the server.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub logged_in: bool,
    pub token: Option<String>,
    pub last_detail: String,
    pub server_time: f32,
    pub connected_users: Vec<String>,
}

pub struct SessionClient {
    endpoint: Arc<ClientEndpoint>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionClient {
    /// Wires the response handlers into the endpoint. Call once, before the
    /// first tick.
    pub fn new(endpoint: Arc<ClientEndpoint>) -> Self {
        let state = Arc::new(Mutex::new(SessionState::default()));

        {
            let state = Arc::clone(&state);
            let outbound = endpoint.outbound();
            endpoint.register_handler(
                Subject::LoginResponse,
                Arc::new(move |message| {
                    let response = match LoginResponse::decode(&mut message.payload_reader()) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!("bad login response: {err}");
                            return;
                        }
                    };
                    info!("login: {}", response.detail);
                    let mut state = state.lock().unwrap();
                    state.logged_in = response.success;
                    state.last_detail = response.detail;
                    state.server_time = response.server_time;
                    if response.success {
                        state.token = Some(response.token.clone());
                        // Fetch the roster right away so the first snapshot
                        // after login is already populated.
                        outbound.push(OutboundMessage::reply(
                            ServerInfoRequest {
                                token: response.token,
                            }
                            .encode(),
                            message.connection_id,
                        ));
                    } else {
                        state.token = None;
                    }
                }),
            );
        }

        {
            let state = Arc::clone(&state);
            endpoint.register_handler(
                Subject::LogOutResponse,
                Arc::new(move |message| {
                    let response = match LogOutResponse::decode(&mut message.payload_reader()) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!("bad logout response: {err}");
                            return;
                        }
                    };
                    info!("logout: {}", response.detail);
                    let mut state = state.lock().unwrap();
                    state.last_detail = response.detail;
                    state.server_time = response.server_time;
                    if response.success {
                        state.logged_in = false;
                        state.token = None;
                        state.connected_users.clear();
                    }
                }),
            );
        }

        {
            let state = Arc::clone(&state);
            endpoint.register_handler(
                Subject::ServerInfoResponse,
                Arc::new(move |message| {
                    let response = match ServerInfoResponse::decode(&mut message.payload_reader())
                    {
                        Ok(response) => response,
                        Err(err) => {
                            warn!("bad server info response: {err}");
                            return;
                        }
                    };
                    let mut state = state.lock().unwrap();
                    state.last_detail = response.detail;
                    if response.success {
                        state.server_time = response.server_time;
                        state.connected_users = response.user_names;
                    }
                }),
            );
        }

        {
            let state = Arc::clone(&state);
            endpoint.register_handler(
                Subject::PlayerStatusUpdate,
                Arc::new(move |message| {
                    let update = match PlayerStatusUpdate::decode(&mut message.payload_reader()) {
                        Ok(update) => update,
                        Err(err) => {
                            warn!("bad status update: {err}");
                            return;
                        }
                    };
                    let mut state = state.lock().unwrap();
                    state.server_time = update.server_time;
                    if update.connected {
                        if !state.connected_users.contains(&update.user_name) {
                            state.connected_users.push(update.user_name);
                        }
                    } else {
                        state.connected_users.retain(|name| name != &update.user_name);
                    }
                }),
            );
        }

        endpoint.register_handler(
            Subject::ServerMessage,
            Arc::new(|message| {
                match ServerNotice::decode(&mut message.payload_reader()) {
                    Ok(notice) => info!("server notice: {}", notice.text),
                    Err(err) => warn!("bad server notice: {err}"),
                }
            }),
        );

        SessionClient { endpoint, state }
    }

    pub fn endpoint(&self) -> &ClientEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().unwrap().logged_in
    }

    /// Queues a login for `user_id`. The result lands in the snapshot once
    /// the response arrives.
    pub fn login(&self, user_id: &str) {
        let request = LoginRequest {
            user_id: user_id.to_string(),
        };
        self.endpoint
            .add_output_message(OutboundMessage::reply(request.encode(), 0));
    }

    /// Queues a logout with the held token. False when no session is held.
    pub fn logout(&self) -> bool {
        let Some(token) = self.state.lock().unwrap().token.clone() else {
            warn!("logout requested without a session token");
            return false;
        };
        self.endpoint
            .add_output_message(OutboundMessage::reply(LogOutRequest { token }.encode(), 0));
        true
    }

    /// Queues a roster refresh. False when no session is held.
    pub fn request_server_info(&self) -> bool {
        let Some(token) = self.state.lock().unwrap().token.clone() else {
            warn!("roster requested without a session token");
            return false;
        };
        self.endpoint.add_output_message(OutboundMessage::reply(
            ServerInfoRequest { token }.encode(),
            0,
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::transport::memory::MemoryTransport;
    use shared::transport::Transport;

    fn session() -> SessionClient {
        let transport = Arc::new(MemoryTransport::new());
        SessionClient::new(Arc::new(ClientEndpoint::new(
            transport as Arc<dyn Transport>,
        )))
    }

    #[test]
    fn requests_without_a_token_are_refused() {
        let client = session();
        assert!(!client.logout());
        assert!(!client.request_server_info());
        assert!(!client.is_logged_in());
    }

    #[test]
    fn initial_snapshot_is_empty() {
        let client = session();
        let state = client.state();
        assert!(!state.logged_in);
        assert!(state.token.is_none());
        assert!(state.connected_users.is_empty());
    }
}
