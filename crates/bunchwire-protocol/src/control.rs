//! Typed control messages carried on the reserved control channel.
//!
//! Every control message is a 1-byte tag followed by a fixed, versioned
//! parameter list. The registry maps tags to parameter signatures so that a
//! peer can skip over a registered message it does not handle without
//! interpreting it; the arity table is what keeps protocol-version bumps
//! from desynchronizing older peers.
//!
//! Parameters are serialized big-endian inside the bunch payload. The
//! `swap` flag flips multi-byte values for a peer whose serialization runs
//! in the opposite byte order; the server decides it once from the Hello
//! magic and adapts both directions.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use bunchwire_core::error::ErrorKind;

/// Control message tags. Stable wire values; new messages append.
pub mod tags {
    /// First message of the handshake, client to server.
    pub const HELLO: u8 = 0;
    /// Handshake success notification, server to client.
    pub const WELCOME: u8 = 1;
    /// Random challenge, server to client.
    pub const CHALLENGE: u8 = 2;
    /// Challenge response, client to server.
    pub const RESPONSE: u8 = 3;
    /// Requested send-rate change.
    pub const NETSPEED: u8 = 4;
    /// Human-readable failure notification before teardown.
    pub const FAILURE: u8 = 5;
    /// Client is ready for application traffic.
    pub const JOIN: u8 = 6;
    /// Free-form diagnostic text.
    pub const DEBUG_TEXT: u8 = 7;
}

/// Wire shape of one control-message parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Length-prefixed UTF-8 string.
    Str,
}

/// Registered shape of one control message.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    /// Human-readable message name, for logs and errors.
    pub name: &'static str,
    /// Parameter signature, in wire order.
    pub params: &'static [ParamKind],
}

/// Total, versioned mapping from tag to parameter signature.
///
/// Built once at process start and passed into connection construction;
/// registering the same tag twice is a programming error and fails fast.
pub struct ControlRegistry {
    slots: [Option<MessageSpec>; 256],
}

impl ControlRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { slots: [None; 256] }
    }

    /// Registers a message shape under `tag`.
    ///
    /// Panics if the tag is already taken: two messages cannot share a
    /// wire tag, and this is a startup-time mistake, not a runtime
    /// condition.
    pub fn register(&mut self, tag: u8, name: &'static str, params: &'static [ParamKind]) {
        if let Some(existing) = &self.slots[tag as usize] {
            panic!(
                "control tag {} registered twice ('{}' then '{}')",
                tag, existing.name, name
            );
        }
        self.slots[tag as usize] = Some(MessageSpec { name, params });
    }

    /// Builds the registry of standard messages.
    pub fn standard() -> Self {
        use ParamKind::*;
        let mut registry = Self::new();
        registry.register(tags::HELLO, "Hello", &[U16, U32]);
        registry.register(tags::WELCOME, "Welcome", &[U32]);
        registry.register(tags::CHALLENGE, "Challenge", &[U32]);
        registry.register(tags::RESPONSE, "Response", &[U32]);
        registry.register(tags::NETSPEED, "Netspeed", &[U32]);
        registry.register(tags::FAILURE, "Failure", &[Str]);
        registry.register(tags::JOIN, "Join", &[]);
        registry.register(tags::DEBUG_TEXT, "DebugText", &[Str]);
        registry
    }

    /// Returns whether a tag is registered.
    pub fn is_registered(&self, tag: u8) -> bool {
        self.slots[tag as usize].is_some()
    }

    /// Returns the registered name of a tag.
    pub fn name(&self, tag: u8) -> Option<&'static str> {
        self.slots[tag as usize].map(|s| s.name)
    }

    /// Decodes the parameters of message `tag` from the cursor.
    ///
    /// Unknown tags come back as [`ErrorKind::UnknownTag`] without
    /// consuming anything; a short buffer is
    /// [`ErrorKind::TruncatedParams`].
    pub fn decode(
        &self,
        tag: u8,
        cursor: &mut Cursor<&[u8]>,
        swap: bool,
    ) -> Result<ControlMessage, ErrorKind> {
        let spec = self.slots[tag as usize].ok_or(ErrorKind::UnknownTag(tag))?;
        let message = match tag {
            tags::HELLO => ControlMessage::Hello {
                magic: read_u16(cursor, swap).map_err(|_| trunc(spec))?,
                version: read_u32(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::WELCOME => ControlMessage::Welcome {
                session_id: read_u32(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::CHALLENGE => ControlMessage::Challenge {
                value: read_u32(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::RESPONSE => ControlMessage::Response {
                digest: read_u32(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::NETSPEED => ControlMessage::Netspeed {
                rate: read_u32(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::FAILURE => ControlMessage::Failure {
                reason: read_string(cursor, swap).map_err(|_| trunc(spec))?,
            },
            tags::JOIN => ControlMessage::Join,
            tags::DEBUG_TEXT => ControlMessage::DebugText {
                text: read_string(cursor, swap).map_err(|_| trunc(spec))?,
            },
            // Registered by an extension but not modeled here; the caller
            // can still skip it via `discard`.
            _ => return Err(ErrorKind::UnknownTag(tag)),
        };
        Ok(message)
    }

    /// Consumes and ignores the parameters of message `tag` using the
    /// registered signature, leaving the cursor at the next message
    /// boundary.
    pub fn discard(
        &self,
        tag: u8,
        cursor: &mut Cursor<&[u8]>,
        swap: bool,
    ) -> Result<(), ErrorKind> {
        let spec = self.slots[tag as usize].ok_or(ErrorKind::UnknownTag(tag))?;
        for param in spec.params {
            let result = match param {
                ParamKind::U16 => read_u16(cursor, swap).map(|_| ()),
                ParamKind::U32 => read_u32(cursor, swap).map(|_| ()),
                ParamKind::Str => read_string(cursor, swap).map(|_| ()),
            };
            result.map_err(|_| trunc(spec))?;
        }
        Ok(())
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn trunc(spec: MessageSpec) -> ErrorKind {
    ErrorKind::TruncatedParams(spec.name)
}

/// One typed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// First message of the handshake; carries the endianness probe.
    Hello {
        /// Endianness probe value.
        magic: u16,
        /// Sender's protocol version.
        version: u32,
    },
    /// Handshake success notification.
    Welcome {
        /// Server-assigned session identifier.
        session_id: u32,
    },
    /// Server challenge the client must answer.
    Challenge {
        /// Random challenge value.
        value: u32,
    },
    /// Client answer to a challenge.
    Response {
        /// Digest derived from the challenge value.
        digest: u32,
    },
    /// Requested send-rate change, applied to the receiving side's pacing.
    Netspeed {
        /// Requested rate in bytes per second.
        rate: u32,
    },
    /// Human-readable failure notification before teardown.
    Failure {
        /// Failure description.
        reason: String,
    },
    /// Client is ready for application traffic.
    Join,
    /// Free-form diagnostic text.
    DebugText {
        /// Diagnostic payload.
        text: String,
    },
}

impl ControlMessage {
    /// Returns the wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Hello { .. } => tags::HELLO,
            ControlMessage::Welcome { .. } => tags::WELCOME,
            ControlMessage::Challenge { .. } => tags::CHALLENGE,
            ControlMessage::Response { .. } => tags::RESPONSE,
            ControlMessage::Netspeed { .. } => tags::NETSPEED,
            ControlMessage::Failure { .. } => tags::FAILURE,
            ControlMessage::Join => tags::JOIN,
            ControlMessage::DebugText { .. } => tags::DEBUG_TEXT,
        }
    }

    /// Appends tag and parameters to `buffer`.
    pub fn encode(&self, buffer: &mut Vec<u8>, swap: bool) {
        buffer.write_u8(self.tag()).expect("vec write");
        match self {
            ControlMessage::Hello { magic, version } => {
                write_u16(buffer, *magic, swap);
                write_u32(buffer, *version, swap);
            }
            ControlMessage::Welcome { session_id } => write_u32(buffer, *session_id, swap),
            ControlMessage::Challenge { value } => write_u32(buffer, *value, swap),
            ControlMessage::Response { digest } => write_u32(buffer, *digest, swap),
            ControlMessage::Netspeed { rate } => write_u32(buffer, *rate, swap),
            ControlMessage::Failure { reason } => write_string(buffer, reason, swap),
            ControlMessage::Join => {}
            ControlMessage::DebugText { text } => write_string(buffer, text, swap),
        }
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>, swap: bool) -> std::io::Result<u16> {
    let v = cursor.read_u16::<BigEndian>()?;
    Ok(if swap { v.swap_bytes() } else { v })
}

fn read_u32(cursor: &mut Cursor<&[u8]>, swap: bool) -> std::io::Result<u32> {
    let v = cursor.read_u32::<BigEndian>()?;
    Ok(if swap { v.swap_bytes() } else { v })
}

fn read_string(cursor: &mut Cursor<&[u8]>, swap: bool) -> std::io::Result<String> {
    let len = read_u16(cursor, swap)? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    // Guard against a hostile length before allocating.
    if len as u64 > remaining {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "string length exceeds buffer",
        ));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_u16(buffer: &mut Vec<u8>, value: u16, swap: bool) {
    let v = if swap { value.swap_bytes() } else { value };
    buffer.write_u16::<BigEndian>(v).expect("vec write");
}

fn write_u32(buffer: &mut Vec<u8>, value: u32, swap: bool) {
    let v = if swap { value.swap_bytes() } else { value };
    buffer.write_u32::<BigEndian>(v).expect("vec write");
}

fn write_string(buffer: &mut Vec<u8>, value: &str, swap: bool) {
    write_u16(buffer, value.len() as u16, swap);
    buffer.write_all(value.as_bytes()).expect("vec write");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &ControlMessage) -> ControlMessage {
        let registry = ControlRegistry::standard();
        let mut buf = Vec::new();
        msg.encode(&mut buf, false);
        let mut cursor = Cursor::new(buf.as_slice());
        let tag = cursor.read_u8().unwrap();
        registry.decode(tag, &mut cursor, false).unwrap()
    }

    #[test]
    fn test_message_round_trips() {
        let messages = [
            ControlMessage::Hello { magic: 0x6E57, version: 1 },
            ControlMessage::Welcome { session_id: 0xDEADBEEF },
            ControlMessage::Challenge { value: 42 },
            ControlMessage::Response { digest: 0x1234_5678 },
            ControlMessage::Netspeed { rate: 20_000 },
            ControlMessage::Failure { reason: "server full".to_string() },
            ControlMessage::Join,
            ControlMessage::DebugText { text: "ping 32ms".to_string() },
        ];
        for msg in messages {
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn test_discard_consumes_exact_arity() {
        let registry = ControlRegistry::standard();
        // Hello has two parameters (u16 + u32 = 6 bytes after the tag).
        let msg = ControlMessage::Hello { magic: 7, version: 9 };
        let mut buf = Vec::new();
        msg.encode(&mut buf, false);
        // A second message directly behind it.
        ControlMessage::Join.encode(&mut buf, false);

        let mut cursor = Cursor::new(buf.as_slice());
        let tag = cursor.read_u8().unwrap();
        registry.discard(tag, &mut cursor, false).unwrap();
        assert_eq!(cursor.position(), 7);
        // The stream is positioned at the next message boundary.
        assert_eq!(cursor.read_u8().unwrap(), tags::JOIN);
    }

    #[test]
    fn test_unknown_tag_is_reported_without_consuming() {
        let registry = ControlRegistry::standard();
        let buf = [0u8; 4];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(matches!(
            registry.decode(0xEE, &mut cursor, false),
            Err(ErrorKind::UnknownTag(0xEE))
        ));
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_truncated_params_are_reported() {
        let registry = ControlRegistry::standard();
        let msg = ControlMessage::Challenge { value: 99 };
        let mut buf = Vec::new();
        msg.encode(&mut buf, false);
        buf.truncate(3);

        let mut cursor = Cursor::new(&buf[1..]);
        assert!(matches!(
            registry.decode(tags::CHALLENGE, &mut cursor, false),
            Err(ErrorKind::TruncatedParams("Challenge"))
        ));
    }

    #[test]
    fn test_hostile_string_length_rejected() {
        let registry = ControlRegistry::standard();
        // Failure message claiming a 0xFFFF-byte string with a 2-byte body.
        let buf = [0xFFu8, 0xFF, b'h', b'i'];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(registry.decode(tags::FAILURE, &mut cursor, false).is_err());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_fails_fast() {
        let mut registry = ControlRegistry::standard();
        registry.register(tags::HELLO, "Hello2", &[]);
    }

    #[test]
    fn test_byte_swapped_peer_round_trips() {
        let registry = ControlRegistry::standard();
        let msg = ControlMessage::Challenge { value: 0x0102_0304 };
        // A peer writing in the opposite byte order.
        let mut buf = Vec::new();
        msg.encode(&mut buf, true);
        let mut cursor = Cursor::new(buf.as_slice());
        let tag = cursor.read_u8().unwrap();
        // Reading with swapping enabled recovers the value.
        assert_eq!(registry.decode(tag, &mut cursor, true).unwrap(), msg);
    }
}
