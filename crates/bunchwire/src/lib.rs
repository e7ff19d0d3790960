#![warn(missing_docs)]

//! Bunchwire: a small public API facade for the workspace.
//!
//! This crate re-exports the types needed to run the channel/bunch
//! transport between two endpoints:
//!
//! - Connection driving (`Connection`, `ConnectionEvent`, `Role`)
//! - Channel traffic kinds (`ChannelType`)
//! - Control messages (`ControlMessage`, `ControlRegistry`)
//! - Core configuration and the transport boundary (`Config`,
//!   `DatagramSink`)
//!
//! Example
//! ```ignore
//! use std::{sync::Arc, time::Instant};
//! use bunchwire::prelude::*;
//!
//! let registry = Arc::new(ControlRegistry::standard());
//! let now = Instant::now();
//! let mut client = Connection::new(Role::Client, Config::default(), registry.clone(), now);
//! let mut sink = LoopbackSink::new();
//!
//! // Kick off the handshake; datagrams land in the sink for the
//! // transport to carry.
//! client.connect(&mut sink, now).unwrap();
//! for datagram in sink.drain() {
//!     // hand to the UDP socket ...
//! }
//! ```

// Core config, errors, transport boundary
pub use bunchwire_core::{
    config::{Config, SimulationConfig},
    error::ErrorKind,
    shared::SharedBytes,
    transport::{DatagramSink, LoopbackSink},
};
// Protocol: channel kinds and control messages
pub use bunchwire_protocol::{
    bunch::ChannelType,
    control::{ControlMessage, ControlRegistry},
};
// Session: connections and channels
pub use bunchwire_session::{
    channel::ChannelState,
    connection::{CloseReason, Connection, ConnectionEvent, ConnectionState, Role},
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        ChannelState, ChannelType, CloseReason, Config, Connection, ConnectionEvent,
        ConnectionState, ControlMessage, ControlRegistry, DatagramSink, ErrorKind, LoopbackSink,
        Role, SharedBytes, SimulationConfig,
    };
}
