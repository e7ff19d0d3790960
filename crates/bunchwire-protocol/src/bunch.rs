//! Bunch framing.
//!
//! A bunch is one framed application message plus its routing and
//! reliability header: the atomic unit multiplexed onto a physical packet.
//! Header encoding is a pure transformation over the bit stream; decoding
//! rejects truncated or out-of-range headers without reading past the
//! buffer end, and the caller drops the owning packet.

use std::convert::TryFrom;

use bunchwire_core::{
    bits::{BitReader, BitWriter},
    constants::{
        CHANNEL_INDEX_BITS, CHANNEL_TYPE_BITS, CHANNEL_SEQUENCE_MODULUS, LENGTH_BITS,
        SEQUENCE_BITS,
    },
    error::{DecodingErrorKind, ErrorKind},
    shared::SharedBytes,
};

/// The kind of traffic a channel carries. Three bits on the wire; zero is
/// deliberately invalid so an all-zero header cannot name a channel type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelType {
    /// Reserved session-management channel, always index 0, always reliable.
    Control = 1,
    /// Gameplay object replication.
    Actor = 2,
    /// File transfer.
    File = 3,
    /// Voice data.
    Voice = 4,
}

impl ChannelType {
    /// Returns the wire value of this channel type.
    pub fn to_bits(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelType::Control),
            2 => Ok(ChannelType::Actor),
            3 => Ok(ChannelType::File),
            4 => Ok(ChannelType::Voice),
            _ => Err(ErrorKind::Decoding(DecodingErrorKind::ChannelType)),
        }
    }
}

/// One framed message plus header.
///
/// `sequence` is present exactly when `reliable` is set; it is the
/// channel-local reliability ordinal, not the physical packet id. The
/// packet id a bunch was last sent in is tracked by the sender's
/// reliability window for ack correlation and never appears in the bunch
/// header itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bunch {
    /// Index of the owning channel within the connection.
    pub channel_index: u16,
    /// Traffic kind of the owning channel.
    pub channel_type: ChannelType,
    /// First bunch on the channel; the receiver opens the channel on it.
    pub open: bool,
    /// Last bunch on the channel; triggers channel teardown.
    pub close: bool,
    /// Whether this bunch participates in reliable ordered delivery.
    pub reliable: bool,
    /// Channel-local sequence number, present iff `reliable`.
    pub sequence: Option<u16>,
    /// Opaque application payload.
    pub payload: SharedBytes,
}

impl Bunch {
    /// Number of header bits a bunch with the given reliability occupies,
    /// including the payload length field.
    pub fn header_bits(reliable: bool) -> usize {
        let mut bits = CHANNEL_INDEX_BITS + CHANNEL_TYPE_BITS + 3 + LENGTH_BITS;
        if reliable {
            bits += SEQUENCE_BITS;
        }
        bits as usize
    }

    /// Appends the bunch header and payload to the packet under
    /// construction.
    pub fn encode(&self, writer: &mut BitWriter) {
        debug_assert_eq!(self.reliable, self.sequence.is_some());
        writer.write_bits(u32::from(self.channel_index), CHANNEL_INDEX_BITS);
        writer.write_bits(self.channel_type.to_bits(), CHANNEL_TYPE_BITS);
        writer.write_bool(self.open);
        writer.write_bool(self.close);
        writer.write_bool(self.reliable);
        if let Some(sequence) = self.sequence {
            debug_assert!(sequence < CHANNEL_SEQUENCE_MODULUS);
            writer.write_bits(u32::from(sequence), SEQUENCE_BITS);
        }
        writer.write_bits((self.payload.len() * 8) as u32, LENGTH_BITS);
        writer.write_bytes(self.payload.as_slice());
    }

    /// Decodes one bunch record from a received packet.
    ///
    /// `max_packet_size` bounds the payload length field so a hostile
    /// length cannot force a large allocation.
    pub fn decode(reader: &mut BitReader<'_>, max_packet_size: usize) -> Result<Bunch, ErrorKind> {
        let channel_index = reader.read_bits(CHANNEL_INDEX_BITS) as u16;
        let channel_type = ChannelType::try_from(reader.read_bits(CHANNEL_TYPE_BITS) as u8);
        let open = reader.read_bool();
        let close = reader.read_bool();
        let reliable = reader.read_bool();
        if reader.is_overflowed() {
            return Err(DecodingErrorKind::MalformedHeader.into());
        }
        let channel_type = channel_type?;
        let sequence = if reliable {
            Some(reader.read_bits(SEQUENCE_BITS) as u16)
        } else {
            None
        };
        let payload_bits = reader.read_bits(LENGTH_BITS) as usize;
        if reader.is_overflowed() {
            return Err(DecodingErrorKind::MalformedHeader.into());
        }
        if payload_bits > max_packet_size * 8 {
            return Err(DecodingErrorKind::PayloadLength.into());
        }
        let payload = reader.read_bytes(payload_bits.div_ceil(8));
        if reader.is_overflowed() {
            return Err(DecodingErrorKind::Truncated.into());
        }
        Ok(Bunch {
            channel_index,
            channel_type,
            open,
            close,
            reliable,
            sequence,
            payload: SharedBytes::from_vec(payload),
        })
    }
}
