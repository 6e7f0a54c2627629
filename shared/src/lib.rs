//! Protocol and pipeline pieces shared by the session client and server:
//! the binary wire format, the inbound/outbound envelopes, subject dispatch,
//! the worker-thread pipeline and the poll-style transport contract with its
//! bundled in-memory and UDP adapters.

pub mod clock;
pub mod dispatcher;
pub mod message;
pub mod pipeline;
pub mod transport;
pub mod wire;

/// Default per-call cap on polled events and sent messages. Keeps one tick's
/// listen/send pass bounded; remaining work carries over to the next tick.
pub const DEFAULT_MAX_MESSAGES: u16 = 50;
