use std::io;

use thiserror::Error;

/// Errors surfaced by the bunchwire transport layers.
///
/// Decode-level failures are always contained to the single packet or bunch
/// being parsed; they never cross the packet-processing boundary. Channel- and
/// connection-fatal conditions are reported to callers as state transitions
/// and terminal events, with these variants describing the triggering cause.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A packet or bunch field failed to decode.
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingErrorKind),
    /// The outgoing reliable queue for a channel is full. The peer has
    /// stopped acknowledging; fatal for the channel, not retryable.
    #[error("outgoing reliable window is full")]
    WindowFull,
    /// An incoming reliable bunch violated the reorder window bounds.
    #[error("incoming reliable sequence violates the reorder window")]
    WindowViolation,
    /// The channel is closing, closed, or broken and cannot send.
    #[error("channel is closed")]
    ChannelClosed,
    /// Every channel slot on the connection is occupied.
    #[error("no free channel index")]
    NoFreeChannels,
    /// The connection has not completed its handshake.
    #[error("connection is not open")]
    NotConnected,
    /// A payload cannot fit into a single packet.
    #[error("payload too large for one packet")]
    PayloadTooLarge,
    /// A control message carried a tag the registry does not know.
    #[error("unknown control message tag {0}")]
    UnknownTag(u8),
    /// A control message ended before all registered parameters were read.
    #[error("truncated parameters for control message '{0}'")]
    TruncatedParams(&'static str),
    /// The underlying datagram transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Decode-level failure causes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// A bunch header field was out of range or inconsistent.
    #[error("malformed bunch header")]
    MalformedHeader,
    /// The channel type field did not name a known channel type.
    #[error("unknown channel type")]
    ChannelType,
    /// A payload length field exceeded the packet bound.
    #[error("payload length out of bounds")]
    PayloadLength,
    /// The buffer ended before the advertised content.
    #[error("truncated buffer")]
    Truncated,
    /// The packet carried no terminating trailer bit.
    #[error("missing packet trailer")]
    TrailerMissing,
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;
