#![warn(missing_docs)]

//! bunchwire-session: connection and channel state machines.
//!
//! One [`Connection`](connection::Connection) owns a table of
//! [`Channel`](channel::Channel)s and multiplexes their bunches into
//! physical packets over an unreliable datagram transport. The server side
//! of a connection runs a pre-trust [`handshake`](handshake) on the
//! reserved control channel before any application traffic is accepted.

/// Channel lifecycle and per-channel dispatch.
pub mod channel;
/// The connection: channel table, packet assembly, acks, events.
pub mod connection;
/// Pre-trust handshake state machine.
pub mod handshake;
/// Round-trip time and loss accounting.
pub mod metrics;
/// Simulated network conditions for local testing.
pub mod simulation;

pub use channel::{Channel, ChannelState};
pub use connection::{CloseReason, Connection, ConnectionEvent, ConnectionState, Role};
pub use handshake::{Handshake, HandshakeState};
