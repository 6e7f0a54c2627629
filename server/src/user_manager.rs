//! Session authority: the registry binding user identity, session token and
//! live connection.
//!
//! One mutex owns all three indices plus the cached roster snapshots, so a
//! connect or disconnect commits atomically: there is no window in which a
//! client is indexed by connection but holds no token. Identities are
//! provisioned once and never destroyed; only the token and connection
//! indices track the currently connected subset.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{info, warn};
use thiserror::Error;

use shared::transport::{ConnectionId, SocketId};

/// How often a colliding token is regenerated before giving up. Collisions
/// are probabilistically absent; the registry still checks every insertion.
const TOKEN_RETRY_LIMIT: u32 = 8;

/// Domain-level authentication failures. `Display` carries the detail string
/// sent back to the requesting connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Error :: User {0} does not exist")]
    UnknownUser(String),
    #[error("Error :: User {user_id} already holds a session token")]
    AlreadyConnected { user_id: String },
    #[error("Error :: Connection {connection_id} is already bound to a user")]
    ConnectionBusy { connection_id: ConnectionId },
    #[error("There is no User with TokenID: {0}")]
    UnknownToken(String),
    #[error("No Client Connected from: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Client Connected from: {connection_id} is different from TokenID: {token}")]
    TokenMismatch {
        token: String,
        connection_id: ConnectionId,
    },
    #[error("Error :: could not issue a unique token for User {0}")]
    TokenExhausted(String),
}

/// Mutable session half of a client record.
#[derive(Debug, Clone)]
pub struct Session {
    pub connected: bool,
    pub connection_id: ConnectionId,
    pub sender_id: SocketId,
    pub session_start_time: f32,
    pub last_transition_time: SystemTime,
    pub token: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            connected: false,
            connection_id: 0,
            sender_id: 0,
            session_start_time: 0.0,
            last_transition_time: SystemTime::UNIX_EPOCH,
            token: None,
        }
    }
}

/// One provisioned identity plus its current session state. Created once,
/// never destroyed; shared by reference from every index. The invariant
/// `token.is_some() == connected` holds whenever no mutation is in flight.
#[derive(Debug)]
pub struct ClientInfo {
    user_id: String,
    user_name: String,
    session: Mutex<Session>,
}

impl ClientInfo {
    fn new(user_id: &str, user_name: &str) -> Self {
        ClientInfo {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().unwrap().connected
    }

    fn connect(
        &self,
        connection_id: ConnectionId,
        sender_id: SocketId,
        session_time: f32,
        token: String,
    ) {
        let mut session = self.session.lock().unwrap();
        session.connected = true;
        session.connection_id = connection_id;
        session.sender_id = sender_id;
        session.session_start_time = session_time;
        session.last_transition_time = SystemTime::now();
        session.token = Some(token);
    }

    fn disconnect(&self) {
        let mut session = self.session.lock().unwrap();
        session.connected = false;
        session.session_start_time = 0.0;
        session.last_transition_time = SystemTime::now();
        session.token = None;
    }
}

/// Callback invoked after every successful connect/disconnect mutation, with
/// the user name and new connected status. Installed by the protocol-handler
/// layer to broadcast the player-status update.
pub type StatusNotifier = Box<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Default)]
struct Registry {
    users: HashMap<String, Arc<ClientInfo>>,
    tokens: HashMap<String, Arc<ClientInfo>>,
    connections: HashMap<ConnectionId, Arc<ClientInfo>>,
    connection_cache: Option<Vec<ConnectionId>>,
    name_cache: Option<Vec<String>>,
}

impl Registry {
    fn invalidate_caches(&mut self) {
        self.connection_cache = None;
        self.name_cache = None;
    }
}

#[derive(Default)]
pub struct UserManager {
    registry: Mutex<Registry>,
    notifier: Mutex<Option<StatusNotifier>>,
}

impl UserManager {
    pub fn new() -> Self {
        UserManager::default()
    }

    pub fn set_status_notifier(&self, notifier: StatusNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    /// Registers a new identity. Returns false on a duplicate id. Does not
    /// touch connection state.
    pub fn create_user(&self, user_id: &str, user_name: &str) -> bool {
        let mut registry = self.registry.lock().unwrap();
        if registry.users.contains_key(user_id) {
            warn!("cannot create user, duplicate id: {user_id}");
            return false;
        }
        registry
            .users
            .insert(user_id.to_string(), Arc::new(ClientInfo::new(user_id, user_name)));
        true
    }

    pub fn get_user(&self, user_id: &str) -> Option<Arc<ClientInfo>> {
        self.registry.lock().unwrap().users.get(user_id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.registry.lock().unwrap().users.len()
    }

    /// Binds a provisioned user to a live connection and issues a fresh
    /// session token. The whole transition commits under the registry lock;
    /// on any failure neither client state nor the indices have changed.
    pub fn connect_user(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        sender_id: SocketId,
        session_time: f32,
    ) -> Result<String, AuthError> {
        let (client, token) = {
            let mut registry = self.registry.lock().unwrap();
            let client = registry
                .users
                .get(user_id)
                .cloned()
                .ok_or_else(|| AuthError::UnknownUser(user_id.to_string()))?;
            if client.is_connected() {
                return Err(AuthError::AlreadyConnected {
                    user_id: user_id.to_string(),
                });
            }
            if registry.connections.contains_key(&connection_id) {
                return Err(AuthError::ConnectionBusy { connection_id });
            }

            let mut token = generate_token(user_id);
            let mut retries = 0;
            while registry.tokens.contains_key(&token) {
                retries += 1;
                if retries > TOKEN_RETRY_LIMIT {
                    return Err(AuthError::TokenExhausted(user_id.to_string()));
                }
                token = generate_token(user_id);
            }

            client.connect(connection_id, sender_id, session_time, token.clone());
            registry.connections.insert(connection_id, Arc::clone(&client));
            registry.tokens.insert(token.clone(), Arc::clone(&client));
            registry.invalidate_caches();
            (client, token)
        };

        info!(
            "user {} connected on connection {connection_id}",
            client.user_id()
        );
        self.notify(&client, true);
        Ok(token)
    }

    /// Tears a session down by its token. Returns false on an unknown token.
    pub fn disconnect_by_token(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let client = {
            let mut registry = self.registry.lock().unwrap();
            let Some(client) = registry.tokens.remove(token) else {
                warn!("there is no user with token {token}");
                return false;
            };
            let connection_id = client.session().connection_id;
            registry.connections.remove(&connection_id);
            client.disconnect();
            registry.invalidate_caches();
            client
        };

        info!("user {} disconnected", client.user_id());
        self.notify(&client, false);
        true
    }

    /// Tears a session down by the transport connection that carried it.
    /// Used when the transport reports the peer gone.
    pub fn disconnect_by_connection(&self, connection_id: ConnectionId) -> bool {
        let client = {
            let mut registry = self.registry.lock().unwrap();
            let Some(client) = registry.connections.remove(&connection_id) else {
                warn!("no client connected from {connection_id}");
                return false;
            };
            if let Some(token) = client.session().token {
                registry.tokens.remove(&token);
            }
            client.disconnect();
            registry.invalidate_caches();
            client
        };

        info!(
            "user {} disconnected (connection {connection_id} dropped)",
            client.user_id()
        );
        self.notify(&client, false);
        true
    }

    /// Tears a session down by user id, resolving the live token first.
    pub fn disconnect_by_user(&self, user_id: &str) -> bool {
        let token = {
            let registry = self.registry.lock().unwrap();
            match registry.users.get(user_id) {
                Some(client) => client.session().token,
                None => {
                    warn!("there is no user {user_id}");
                    return false;
                }
            }
        };
        match token {
            Some(token) => self.disconnect_by_token(&token),
            None => false,
        }
    }

    /// Authenticates a request: the token must resolve to a client and the
    /// presenting connection must currently be bound to that same client.
    /// Rejects token replay from a different connection.
    pub fn lookup_by_token_secure(
        &self,
        token: &str,
        connection_id: ConnectionId,
    ) -> Result<Arc<ClientInfo>, AuthError> {
        let registry = self.registry.lock().unwrap();
        let client = registry
            .tokens
            .get(token)
            .ok_or_else(|| AuthError::UnknownToken(token.to_string()))?;
        let bound = registry
            .connections
            .get(&connection_id)
            .ok_or(AuthError::UnknownConnection(connection_id))?;
        if !Arc::ptr_eq(client, bound) {
            return Err(AuthError::TokenMismatch {
                token: token.to_string(),
                connection_id,
            });
        }
        Ok(Arc::clone(client))
    }

    /// Snapshot of every connected connection id. Cached; recomputed lazily
    /// after any connect/disconnect. Never torn: a concurrent reader sees
    /// the full pre- or post-mutation set.
    pub fn connected_connection_ids(&self) -> Vec<ConnectionId> {
        let mut registry = self.registry.lock().unwrap();
        let Registry {
            connections,
            connection_cache,
            ..
        } = &mut *registry;
        connection_cache
            .get_or_insert_with(|| connections.keys().copied().collect())
            .clone()
    }

    /// Snapshot of every connected user's display name, cached like
    /// `connected_connection_ids`.
    pub fn connected_user_names(&self) -> Vec<String> {
        let mut registry = self.registry.lock().unwrap();
        let Registry {
            connections,
            name_cache,
            ..
        } = &mut *registry;
        name_cache
            .get_or_insert_with(|| {
                connections
                    .values()
                    .map(|client| client.user_name().to_string())
                    .collect()
            })
            .clone()
    }

    fn notify(&self, client: &ClientInfo, connected: bool) {
        if let Some(notifier) = &*self.notifier.lock().unwrap() {
            notifier(client.user_name(), connected);
        }
    }
}

/// Opaque session token: 16 random bytes, the current timestamp and a hash
/// of the user id, base64-encoded. Uniqueness is enforced by the registry at
/// insertion, not assumed from entropy.
fn generate_token(user_id: &str) -> String {
    let nonce: [u8; 16] = rand::random();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);

    let mut raw = Vec::with_capacity(32);
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&stamp.to_be_bytes());
    raw.extend_from_slice(&hasher.finish().to_be_bytes());
    BASE64.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with_user() -> UserManager {
        let manager = UserManager::new();
        assert!(manager.create_user("u1", "u1_UserName"));
        manager
    }

    #[test]
    fn create_user_succeeds_exactly_once() {
        let manager = UserManager::new();
        assert!(manager.create_user("u1", "u1_UserName"));
        assert!(!manager.create_user("u1", "someone else"));
        assert_eq!(manager.user_count(), 1);
    }

    #[test]
    fn connect_issues_a_token_bound_to_the_connection() {
        let manager = manager_with_user();
        let token = manager.connect_user("u1", 7, 1, 1.5).unwrap();
        assert!(token.len() >= 32);

        let client = manager.lookup_by_token_secure(&token, 7).unwrap();
        assert_eq!(client.user_id(), "u1");
        assert!(client.is_connected());
        let session = client.session();
        assert_eq!(session.connection_id, 7);
        assert_eq!(session.token.as_deref(), Some(token.as_str()));
    }

    #[test]
    fn unknown_user_cannot_connect() {
        let manager = manager_with_user();
        let err = manager.connect_user("ghost", 7, 1, 0.0).unwrap_err();
        assert_eq!(err, AuthError::UnknownUser("ghost".to_string()));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn busy_connection_rejected_without_mutating_either_client() {
        let manager = manager_with_user();
        manager.create_user("u2", "u2_UserName");
        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();

        let err = manager.connect_user("u2", 7, 1, 0.0).unwrap_err();
        assert!(matches!(err, AuthError::ConnectionBusy { connection_id: 7 }));

        // u1 untouched, u2 still fully disconnected.
        assert!(manager.lookup_by_token_secure(&token, 7).is_ok());
        let u2 = manager.get_user("u2").unwrap();
        assert!(!u2.is_connected());
        assert!(u2.session().token.is_none());
        assert_eq!(manager.connected_user_names(), vec!["u1_UserName"]);
    }

    #[test]
    fn double_login_is_refused() {
        let manager = manager_with_user();
        manager.connect_user("u1", 7, 1, 0.0).unwrap();
        let err = manager.connect_user("u1", 8, 1, 0.0).unwrap_err();
        assert!(matches!(err, AuthError::AlreadyConnected { .. }));
        // The second connection stayed unbound.
        assert_eq!(manager.connected_connection_ids(), vec![7]);
    }

    #[test]
    fn disconnect_by_token_invalidates_the_token() {
        let manager = manager_with_user();
        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();

        assert!(manager.disconnect_by_token(&token));
        assert!(manager.lookup_by_token_secure(&token, 7).is_err());
        assert!(!manager.disconnect_by_token(&token));

        let client = manager.get_user("u1").unwrap();
        assert!(!client.is_connected());
        assert!(client.session().token.is_none());
        assert_eq!(client.session().session_start_time, 0.0);
    }

    #[test]
    fn disconnect_by_connection_clears_all_indices() {
        let manager = manager_with_user();
        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();

        assert!(manager.disconnect_by_connection(7));
        assert!(manager.connected_connection_ids().is_empty());
        assert!(manager.lookup_by_token_secure(&token, 7).is_err());
        assert!(!manager.disconnect_by_connection(7));
    }

    #[test]
    fn disconnect_by_user_resolves_the_live_token() {
        let manager = manager_with_user();
        manager.connect_user("u1", 7, 1, 0.0).unwrap();
        assert!(manager.disconnect_by_user("u1"));
        assert!(!manager.disconnect_by_user("u1"));
        assert!(!manager.disconnect_by_user("ghost"));
    }

    #[test]
    fn token_replay_from_another_connection_is_rejected() {
        let manager = manager_with_user();
        manager.create_user("u2", "u2_UserName");
        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();
        manager.connect_user("u2", 8, 1, 0.0).unwrap();

        // u2's connection presenting u1's token.
        let err = manager.lookup_by_token_secure(&token, 8).unwrap_err();
        assert!(matches!(err, AuthError::TokenMismatch { .. }));

        // A connection nobody is bound to.
        let err = manager.lookup_by_token_secure(&token, 99).unwrap_err();
        assert_eq!(err, AuthError::UnknownConnection(99));
    }

    #[test]
    fn roster_snapshot_tracks_connects_and_disconnects() {
        let manager = manager_with_user();
        manager.create_user("u2", "u2_UserName");
        assert!(manager.connected_user_names().is_empty());

        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();
        manager.connect_user("u2", 8, 1, 0.0).unwrap();

        let mut names = manager.connected_user_names();
        names.sort();
        assert_eq!(names, vec!["u1_UserName", "u2_UserName"]);

        // No duplicates, ever.
        let names = manager.connected_user_names();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());

        manager.disconnect_by_token(&token);
        assert_eq!(manager.connected_user_names(), vec!["u2_UserName"]);
    }

    #[test]
    fn status_notifier_fires_on_both_transitions() {
        let manager = manager_with_user();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.set_status_notifier(Box::new(move |name, connected| {
            sink.lock().unwrap().push((name.to_string(), connected));
        }));

        let token = manager.connect_user("u1", 7, 1, 0.0).unwrap();
        manager.disconnect_by_token(&token);

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("u1_UserName".to_string(), true),
                ("u1_UserName".to_string(), false)
            ]
        );
    }

    #[test]
    fn tokens_are_unique_across_sessions() {
        let manager = manager_with_user();
        let mut seen = std::collections::HashSet::new();
        for connection in 0..50u32 {
            let token = manager.connect_user("u1", connection + 1, 1, 0.0).unwrap();
            assert!(seen.insert(token.clone()), "token reused: {token}");
            manager.disconnect_by_token(&token);
        }
    }

    #[test]
    fn concurrent_connects_keep_the_registry_consistent() {
        let manager = Arc::new(UserManager::new());
        for index in 0..16 {
            manager.create_user(&format!("user{index}"), &format!("user{index}_UserName"));
        }
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16u32)
            .map(|index| {
                let manager = Arc::clone(&manager);
                let successes = Arc::clone(&successes);
                std::thread::spawn(move || {
                    // Half the threads fight over one connection id.
                    let connection = if index % 2 == 0 { 1000 } else { index };
                    if manager
                        .connect_user(&format!("user{index}"), connection, 1, 0.0)
                        .is_ok()
                    {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one winner for the contested id, everyone else clean.
        let connected = manager.connected_connection_ids();
        assert_eq!(connected.len(), successes.load(Ordering::SeqCst));
        assert_eq!(
            connected.iter().filter(|id| **id == 1000).count(),
            1,
            "contested connection bound more than once"
        );
    }
}
