#![warn(missing_docs)]

//! bunchwire-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all
//! layers of the bunchwire transport:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - The bit-stream codec used for packet and bunch framing
//! - Shared, reference-counted payload buffers
//! - The datagram transport boundary
//!
//! Protocol logic lives in the specialized crates:
//! - `bunchwire-protocol`: bunch framing, sequence arithmetic, reliability
//!   windows, the control-message registry
//! - `bunchwire-session`: channels, connections, the handshake

/// Protocol constants shared across layers.
pub mod constants {
    /// Number of channel slots addressable on one connection.
    pub const MAX_CHANNELS: usize = 1024;
    /// Width of the channel index field in a bunch header.
    pub const CHANNEL_INDEX_BITS: u32 = 10;
    /// Width of the channel type field in a bunch header.
    pub const CHANNEL_TYPE_BITS: u32 = 3;
    /// Physical packet ids wrap at this modulus.
    pub const PACKET_ID_MODULUS: u16 = 16384;
    /// Width of a packet id on the wire.
    pub const PACKET_ID_BITS: u32 = 14;
    /// Per-channel reliable sequence numbers wrap at this modulus.
    pub const CHANNEL_SEQUENCE_MODULUS: u16 = 1024;
    /// Width of a channel sequence number on the wire.
    pub const SEQUENCE_BITS: u32 = 10;
    /// Width of a bunch payload length field (counted in bits).
    pub const LENGTH_BITS: u32 = 14;
    /// Max reliable bunches in flight unacknowledged, per channel direction.
    pub const RELIABLE_WINDOW: usize = 128;
    /// The reserved control channel index. Always present, always reliable.
    pub const CONTROL_CHANNEL_INDEX: u16 = 0;
    /// Number of packet ids covered by the redundant ack bitfield in each
    /// packet header, counting back from the latest received id.
    pub const ACK_BITFIELD_BITS: u16 = 32;
    /// Default upper bound for one physical packet, in bytes.
    pub const MAX_PACKET_DEFAULT: usize = 1024;
    /// Incremental monolithic protocol number.
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Endianness probe value carried by the first handshake message. A peer
    /// whose serialization runs in the opposite byte order produces the
    /// byte-swapped value, which the server detects exactly once.
    pub const HANDSHAKE_MAGIC: u16 = 0x6E57;
}

/// Bit-level reader and writer for packet and bunch framing.
pub mod bits;
/// Configuration options for the protocol and the link conditioner.
pub mod config;
/// Error types shared across layers.
pub mod error;
/// Shared, reference-counted byte slices with zero-copy slicing.
pub mod shared;
/// Datagram transport boundary.
pub mod transport;
