//! Authoritative session server.
//!
//! Hosts a transport socket, authenticates provisioned users against a
//! token-issuing registry and answers the login, logout and roster requests
//! of the session protocol. The endpoint is tick-driven: the embedding
//! application calls `listen` and `send_output_messages` at its own rate.

pub mod endpoint;
pub mod info_manager;
pub mod user_manager;
