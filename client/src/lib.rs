//! Session client library.
//!
//! `endpoint` drives the transport and dispatch pipeline; `session` layers
//! the login/logout/roster protocol on top and exposes a snapshot of the
//! server-reported session state.

pub mod endpoint;
pub mod session;
