//! The connection: one physical multiplexed session with a remote peer.
//!
//! A connection owns the channel table, assembles pending bunches from all
//! channels into outgoing packets with cumulative ack information, and
//! demultiplexes received packets back into per-channel bunches. All state
//! transitions for one connection happen on the owner's poll loop; nothing
//! here blocks or suspends.

use std::{
    collections::{HashMap, VecDeque},
    io::{Cursor, Read},
    sync::Arc,
    time::Instant,
};

use rand::Rng;

use bunchwire_core::{
    bits::{BitReader, BitWriter},
    config::Config,
    constants::{
        ACK_BITFIELD_BITS, CONTROL_CHANNEL_INDEX, HANDSHAKE_MAGIC, MAX_CHANNELS,
        PACKET_ID_BITS, PACKET_ID_MODULUS, PROTOCOL_VERSION,
    },
    error::ErrorKind,
    shared::SharedBytes,
    transport::DatagramSink,
};
use bunchwire_protocol::{
    bunch::{Bunch, ChannelType},
    control::{tags, ControlMessage, ControlRegistry},
    sequence::{best_signed_difference, next_seq, seq_sub, PacketObservation, ReceivedPacketTracker},
};

use crate::{
    channel::{Channel, ChannelState},
    handshake::{expected_response, Handshake, ResponseVerdict},
    metrics::LinkMetrics,
    simulation::LinkConditioner,
};

/// Which side of the session this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake.
    Client,
    /// Challenges the peer before trusting it.
    Server,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; the handshake has not completed.
    Pending,
    /// Handshake complete, application traffic flows.
    Open,
    /// Torn down. Terminal.
    Closed,
}

/// Why a connection was torn down. Surfaced exactly once in the terminal
/// [`ConnectionEvent::Closed`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No packet received within the idle timeout.
    Timeout,
    /// The peer failed the challenge too many times, or broke the
    /// handshake protocol.
    HandshakeFailed,
    /// The peer violated the protocol after the handshake.
    ProtocolViolation,
    /// Closed on purpose by either side.
    ExplicitClose,
}

/// Events surfaced to the owning layer, drained via
/// [`Connection::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed; application channels may open.
    Connected,
    /// The peer opened a channel.
    ChannelOpened {
        /// Index of the new channel.
        channel_index: u16,
        /// Traffic kind of the new channel.
        channel_type: ChannelType,
    },
    /// A channel finished closing and its slot was released.
    ChannelClosed {
        /// Index of the released channel.
        channel_index: u16,
    },
    /// An application payload arrived on a channel.
    Message {
        /// Channel the payload arrived on.
        channel_index: u16,
        /// Traffic kind of that channel.
        channel_type: ChannelType,
        /// The payload bytes.
        payload: SharedBytes,
        /// Whether it arrived on the reliable path.
        reliable: bool,
    },
    /// A control message not consumed by the session itself.
    Control(ControlMessage),
    /// The connection was torn down. Terminal; nothing follows it.
    Closed {
        /// Why the connection ended.
        reason: CloseReason,
    },
}

/// A packet carrying reliable bunches, awaiting acknowledgement.
#[derive(Debug)]
struct InFlightPacket {
    sent_at: Instant,
    /// Channels (with their incarnation) that had reliable bunches aboard.
    channels: Vec<(u16, u32)>,
}

/// The bunch record most recently written to the unflushed packet, kept
/// for merging.
#[derive(Debug)]
struct LastRecord {
    channel_index: u16,
    channel_type: ChannelType,
    reliable: bool,
    sequence: Option<u16>,
    open: bool,
    close: bool,
    start_bit: usize,
    payload: Vec<u8>,
}

/// Builds one outgoing packet: header, bunch records, merge bookkeeping.
#[derive(Debug, Default)]
struct PacketAssembler {
    writer: BitWriter,
    started: bool,
    packet_id: u16,
    last_record: Option<LastRecord>,
    reliable_channels: Vec<(u16, u32)>,
}

impl PacketAssembler {
    fn started(&self) -> bool {
        self.started
    }

    /// Starts a packet: id plus the cumulative ack section.
    fn begin(&mut self, packet_id: u16, ack: Option<(u16, u32)>) {
        debug_assert!(!self.started);
        self.writer = BitWriter::new();
        self.writer.write_bits(u32::from(packet_id), PACKET_ID_BITS);
        match ack {
            Some((latest, mask)) => {
                self.writer.write_bool(true);
                self.writer.write_bits(u32::from(latest), PACKET_ID_BITS);
                self.writer.write_bits(mask, 32);
            }
            None => self.writer.write_bool(false),
        }
        self.packet_id = packet_id;
        self.started = true;
        self.last_record = None;
        self.reliable_channels.clear();
    }

    fn record_fits(&self, record_bits: usize, max_bits: usize) -> bool {
        self.writer.bit_len() + record_bits <= max_bits
    }

    /// Whether the last written record can absorb another payload for the
    /// same channel and reliability.
    fn can_merge(&self, channel_index: u16, reliable: bool) -> bool {
        matches!(
            &self.last_record,
            Some(r) if r.channel_index == channel_index && r.reliable == reliable
        )
    }

    fn merged_fits(&self, extra_len: usize, max_bits: usize) -> bool {
        self.writer.bit_len() + extra_len * 8 <= max_bits
    }

    /// Appends one bunch record and remembers it as the merge candidate.
    fn append_record(
        &mut self,
        channel_index: u16,
        channel_type: ChannelType,
        open: bool,
        close: bool,
        reliable: bool,
        sequence: Option<u16>,
        payload: &[u8],
    ) -> u16 {
        debug_assert!(self.started);
        let start_bit = self.writer.bit_len();
        let bunch = Bunch {
            channel_index,
            channel_type,
            open,
            close,
            reliable,
            sequence,
            payload: SharedBytes::from(payload),
        };
        bunch.encode(&mut self.writer);
        self.last_record = Some(LastRecord {
            channel_index,
            channel_type,
            reliable,
            sequence,
            open,
            close,
            start_bit,
            payload: payload.to_vec(),
        });
        self.packet_id
    }

    /// Rewrites the last record in place with the extra payload appended
    /// and the close flag folded in. The record keeps its sequence.
    fn merge_last(&mut self, extra: &[u8], close: bool) {
        let record = self.last_record.as_mut().expect("merge target exists");
        record.payload.extend_from_slice(extra);
        record.close |= close;
        self.writer.truncate(record.start_bit);
        let bunch = Bunch {
            channel_index: record.channel_index,
            channel_type: record.channel_type,
            open: record.open,
            close: record.close,
            reliable: record.reliable,
            sequence: record.sequence,
            payload: SharedBytes::from(record.payload.as_slice()),
        };
        bunch.encode(&mut self.writer);
    }

    fn note_reliable_channel(&mut self, channel_index: u16, generation: u32) {
        if !self.reliable_channels.contains(&(channel_index, generation)) {
            self.reliable_channels.push((channel_index, generation));
        }
    }

    /// Terminates the packet and resets for the next one.
    fn take_finished(&mut self) -> (u16, Vec<(u16, u32)>, Vec<u8>) {
        debug_assert!(self.started);
        let bytes = std::mem::take(&mut self.writer).finish();
        self.started = false;
        self.last_record = None;
        (self.packet_id, std::mem::take(&mut self.reliable_channels), bytes)
    }
}

enum SendPlan {
    Merge,
    Fresh { sequence: Option<u16>, open: bool },
}

/// One physical multiplexed session between two peers.
pub struct Connection {
    role: Role,
    state: ConnectionState,
    config: Config,
    registry: Arc<ControlRegistry>,
    handshake: Handshake,
    byte_swapping: bool,
    session_id: u32,

    channels: Vec<Option<Channel>>,
    generations: Vec<u32>,
    // Per-index reliable sequence counters that survive channel teardown,
    // so a reused index continues the sequence space of its predecessor
    // and stale retransmissions stay recognizably old.
    in_reliable: Vec<u16>,
    out_reliable: Vec<u16>,

    next_packet_id: u16,
    assembler: PacketAssembler,
    tracker: ReceivedPacketTracker,
    in_flight: HashMap<u16, InFlightPacket>,
    ack_pending: bool,

    metrics: LinkMetrics,
    events: VecDeque<ConnectionEvent>,
    conditioner: Option<LinkConditioner>,

    send_rate: u32,
    allowance: i64,
    last_refill: Instant,
    last_heard: Instant,
}

impl Connection {
    /// Creates a connection in `Pending`. The control channel occupies
    /// index 0 from the start; a client flags its first control bunch with
    /// `open`, a server learns the channel from that bunch.
    pub fn new(role: Role, config: Config, registry: Arc<ControlRegistry>, now: Instant) -> Self {
        let max_channels = config.max_channels.clamp(1, MAX_CHANNELS);
        let mut channels: Vec<Option<Channel>> = (0..max_channels).map(|_| None).collect();
        channels[CONTROL_CHANNEL_INDEX as usize] = Some(Channel::new(
            CONTROL_CHANNEL_INDEX,
            ChannelType::Control,
            role == Role::Client,
            0,
            0,
        ));
        let send_rate = config.send_rate;
        let burst = Self::burst_bytes(send_rate, config.max_packet_size);
        Self {
            role,
            state: ConnectionState::Pending,
            conditioner: config.simulation.clone().map(LinkConditioner::new),
            metrics: LinkMetrics::new(config.rtt_smoothing_factor),
            config,
            registry,
            handshake: Handshake::new(),
            byte_swapping: false,
            session_id: rand::rng().random(),
            channels,
            generations: vec![0; max_channels],
            in_reliable: vec![0; max_channels],
            out_reliable: vec![0; max_channels],
            next_packet_id: 0,
            assembler: PacketAssembler::default(),
            tracker: ReceivedPacketTracker::new(),
            in_flight: HashMap::new(),
            ack_pending: false,
            events: VecDeque::new(),
            send_rate,
            allowance: burst,
            last_refill: now,
            last_heard: now,
        }
    }

    fn burst_bytes(send_rate: u32, max_packet: usize) -> i64 {
        (send_rate as i64 / 10).max(max_packet as i64)
    }

    /// Returns which side of the session this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server-assigned session identifier, carried by Welcome.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Current smoothed round-trip time.
    pub fn rtt(&self) -> std::time::Duration {
        self.metrics.rtt()
    }

    /// Fraction of resolved packets declared lost.
    pub fn loss_rate(&self) -> f32 {
        self.metrics.loss_rate()
    }

    /// Number of sent packets carrying reliable data not yet resolved.
    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether incoming multi-byte control values are byte-swapped for
    /// this peer. Decided once by the handshake.
    pub fn is_byte_swapping(&self) -> bool {
        self.byte_swapping
    }

    /// Lifecycle state of a channel, if the slot is occupied.
    pub fn channel_state(&self, channel_index: u16) -> Option<ChannelState> {
        self.channels
            .get(channel_index as usize)
            .and_then(|slot| slot.as_ref())
            .map(|ch| ch.state())
    }

    /// Drains the next pending event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Reports whether `channel_index` has outgoing capacity. Callers use
    /// this for backpressure instead of queuing unconditionally; with
    /// `saturate` the reliable window may fill to its hard bound and the
    /// pacing budget is ignored.
    pub fn is_ready(&self, channel_index: u16, saturate: bool) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let Some(ch) = self.channels.get(channel_index as usize).and_then(|s| s.as_ref()) else {
            return false;
        };
        ch.is_send_ready(saturate) && (saturate || self.allowance > 0)
    }

    // ===== Channel management =====

    /// Allocates a channel slot, first free index if none is given.
    /// Index 0 is reserved; a slot is unavailable while acks for its
    /// previous incarnation are still in flight.
    pub fn create_channel(
        &mut self,
        channel_type: ChannelType,
        index: Option<u16>,
    ) -> Result<u16, ErrorKind> {
        assert!(
            channel_type != ChannelType::Control,
            "the control channel is created with the connection"
        );
        let index = match index {
            Some(requested) => {
                let i = requested as usize;
                assert!(
                    i < self.channels.len(),
                    "channel index {} beyond the table",
                    requested
                );
                if requested == CONTROL_CHANNEL_INDEX
                    || self.channels[i].is_some()
                    || self.slot_retiring(requested)
                {
                    return Err(ErrorKind::NoFreeChannels);
                }
                requested
            }
            None => {
                let found = (1..self.channels.len() as u16).find(|&i| {
                    self.channels[i as usize].is_none() && !self.slot_retiring(i)
                });
                found.ok_or(ErrorKind::NoFreeChannels)?
            }
        };
        let i = index as usize;
        self.channels[i] = Some(Channel::new(
            index,
            channel_type,
            true,
            self.out_reliable[i],
            self.in_reliable[i],
        ));
        Ok(index)
    }

    /// Opens a channel and announces it to the peer with an empty reliable
    /// open bunch. Returns the allocated index.
    pub fn open_channel(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_type: ChannelType,
        index: Option<u16>,
    ) -> Result<u16, ErrorKind> {
        if self.state != ConnectionState::Open {
            return Err(ErrorKind::NotConnected);
        }
        let index = self.create_channel(channel_type, index)?;
        self.send_on_channel(sink, now, index, &[], true, false, false)?;
        Ok(index)
    }

    /// Sends a close bunch on a channel; the slot is released once the
    /// close is acknowledged.
    pub fn close_channel(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_index: u16,
    ) -> Result<(), ErrorKind> {
        if channel_index == CONTROL_CHANNEL_INDEX {
            return Err(ErrorKind::ChannelClosed);
        }
        self.send_on_channel(sink, now, channel_index, &[], true, true, false)
    }

    fn slot_retiring(&self, channel_index: u16) -> bool {
        self.in_flight
            .values()
            .any(|p| p.channels.iter().any(|&(idx, _)| idx == channel_index))
    }

    fn release_channel(&mut self, channel_index: u16) {
        let i = channel_index as usize;
        if let Some(ch) = self.channels[i].take() {
            let (out_seq, in_seq) = ch.sequence_counters();
            self.out_reliable[i] = out_seq;
            self.in_reliable[i] = in_seq;
            self.generations[i] = self.generations[i].wrapping_add(1);
            self.events
                .push_back(ConnectionEvent::ChannelClosed { channel_index });
        }
    }

    // ===== Sending =====

    /// Sends an application payload on a channel. Reliable payloads go
    /// through the channel's reliability window; unreliable ones ride the
    /// next packet with no delivery guarantee.
    pub fn send(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_index: u16,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), ErrorKind> {
        if channel_index == CONTROL_CHANNEL_INDEX {
            // Application traffic never rides the control channel.
            return Err(ErrorKind::ChannelClosed);
        }
        self.send_on_channel(sink, now, channel_index, payload, reliable, false, false)
    }

    /// Serializes a control message as a single reliable bunch on the
    /// control channel. Control bunches merge: the message stream is
    /// self-delimiting, so coalescing consecutive messages into one bunch
    /// only saves header bits.
    ///
    /// Sending an unregistered tag is a programming error and fails fast.
    pub fn send_control(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        message: ControlMessage,
    ) -> Result<(), ErrorKind> {
        assert!(
            self.registry.is_registered(message.tag()),
            "control tag {} sent without registration",
            message.tag()
        );
        let mut buffer = Vec::new();
        message.encode(&mut buffer, self.byte_swapping);
        self.send_on_channel(sink, now, CONTROL_CHANNEL_INDEX, &buffer, true, false, true)
    }

    /// Client entry point: sends Hello on the control channel.
    pub fn connect(&mut self, sink: &mut dyn DatagramSink, now: Instant) -> Result<(), ErrorKind> {
        debug_assert_eq!(self.role, Role::Client, "servers answer, they do not connect");
        self.send_control(
            sink,
            now,
            ControlMessage::Hello { magic: HANDSHAKE_MAGIC, version: PROTOCOL_VERSION },
        )?;
        self.flush(sink, now)
    }

    fn send_on_channel(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_index: u16,
        payload: &[u8],
        reliable: bool,
        close: bool,
        allow_merge: bool,
    ) -> Result<(), ErrorKind> {
        if self.state == ConnectionState::Closed {
            return Err(ErrorKind::NotConnected);
        }
        if channel_index != CONTROL_CHANNEL_INDEX && self.state != ConnectionState::Open {
            return Err(ErrorKind::NotConnected);
        }
        let i = channel_index as usize;
        let max_bits = self.config.max_packet_size * 8 - 1;
        // Worst-case fixed packet header: id, ack flag, ack body.
        let header_budget = (PACKET_ID_BITS + 1 + PACKET_ID_BITS + 32) as usize;

        let plan: Result<SendPlan, ErrorKind> = 'plan: {
            let Some(ch) = self.channels.get_mut(i).and_then(|slot| slot.as_mut()) else {
                break 'plan Err(ErrorKind::ChannelClosed);
            };
            if !ch.state().can_send() {
                break 'plan Err(ErrorKind::ChannelClosed);
            }
            let open = ch.needs_open_flag();
            let record_bits = Bunch::header_bits(reliable) + payload.len() * 8;
            if record_bits + header_budget > max_bits {
                break 'plan Err(ErrorKind::PayloadTooLarge);
            }
            let mergeable = allow_merge
                && !open
                && self.assembler.can_merge(channel_index, reliable)
                && self.assembler.merged_fits(payload.len(), max_bits);
            if mergeable {
                if reliable {
                    ch.merge_into_last(payload, close);
                }
                break 'plan Ok(SendPlan::Merge);
            }
            let sequence = if reliable {
                match ch.enqueue_reliable(open, close, payload.to_vec()) {
                    Ok(sequence) => Some(sequence),
                    Err(e) => break 'plan Err(e),
                }
            } else {
                None
            };
            Ok(SendPlan::Fresh { sequence, open })
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                if matches!(e, ErrorKind::WindowFull)
                    && channel_index == CONTROL_CHANNEL_INDEX
                {
                    // The control channel cannot lose traffic.
                    self.teardown(CloseReason::ProtocolViolation);
                }
                return Err(e);
            }
        };

        match plan {
            SendPlan::Merge => {
                self.assembler.merge_last(payload, close);
                if close {
                    if let Some(ch) = self.channels[i].as_mut() {
                        ch.set_closing();
                    }
                }
                Ok(())
            }
            SendPlan::Fresh { sequence, open } => {
                let channel_type =
                    self.channels[i].as_ref().expect("channel present").channel_type();
                let packet_id = self.append_fresh_record(
                    sink,
                    now,
                    channel_index,
                    channel_type,
                    open,
                    close,
                    reliable,
                    sequence,
                    payload,
                )?;
                let ch = self.channels[i].as_mut().expect("channel present");
                if reliable {
                    ch.note_last_packet_id(packet_id);
                }
                if open {
                    ch.note_open_packet(packet_id);
                }
                if close {
                    ch.set_closing();
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_fresh_record(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_index: u16,
        channel_type: ChannelType,
        open: bool,
        close: bool,
        reliable: bool,
        sequence: Option<u16>,
        payload: &[u8],
    ) -> Result<u16, ErrorKind> {
        let record_bits = Bunch::header_bits(reliable) + payload.len() * 8;
        let max_bits = self.config.max_packet_size * 8 - 1;
        if self.assembler.started() && !self.assembler.record_fits(record_bits, max_bits) {
            self.flush(sink, now)?;
        }
        if !self.assembler.started() {
            self.begin_packet();
        }
        if !self.assembler.record_fits(record_bits, max_bits) {
            return Err(ErrorKind::PayloadTooLarge);
        }
        let packet_id = self.assembler.append_record(
            channel_index,
            channel_type,
            open,
            close,
            reliable,
            sequence,
            payload,
        );
        if reliable {
            self.assembler
                .note_reliable_channel(channel_index, self.generations[channel_index as usize]);
        }
        Ok(packet_id)
    }

    fn begin_packet(&mut self) {
        let packet_id = self.next_packet_id;
        self.next_packet_id = next_seq(packet_id, PACKET_ID_MODULUS);
        self.assembler.begin(packet_id, self.tracker.ack_info());
    }

    /// Finalizes the packet under construction and hands it to the
    /// transport. No-op when nothing is pending.
    pub fn flush(&mut self, sink: &mut dyn DatagramSink, now: Instant) -> Result<(), ErrorKind> {
        if !self.assembler.started() {
            return Ok(());
        }
        let (packet_id, reliable_channels, bytes) = self.assembler.take_finished();
        if !reliable_channels.is_empty() {
            self.in_flight
                .insert(packet_id, InFlightPacket { sent_at: now, channels: reliable_channels });
        }
        self.metrics.record_sent();
        self.allowance -= bytes.len() as i64;
        self.ack_pending = false;
        match &mut self.conditioner {
            Some(conditioner) => conditioner.send(&bytes, now, sink)?,
            None => sink.send_datagram(&bytes)?,
        }
        Ok(())
    }

    // ===== Receiving =====

    /// Decodes one received datagram: packet-id dedup, ack/nak processing,
    /// then bunch demultiplexing. Malformed input is contained to this
    /// packet; it is dropped, never propagated as a failure.
    pub fn receive_datagram(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        payload: &[u8],
    ) -> Result<(), ErrorKind> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.last_heard = now;
        let mut reader = match BitReader::for_packet(payload) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::debug!(error = %e, "dropping packet without trailer");
                return Ok(());
            }
        };
        let packet_id = reader.read_bits(PACKET_ID_BITS) as u16;
        if reader.is_overflowed() {
            tracing::debug!("dropping truncated packet header");
            return Ok(());
        }
        if self.tracker.observe(packet_id) == PacketObservation::Duplicate {
            tracing::debug!(packet_id, "dropping duplicate packet");
            return Ok(());
        }
        if reader.read_bool() {
            let latest = reader.read_bits(PACKET_ID_BITS) as u16;
            let mask = reader.read_bits(32);
            if reader.is_overflowed() {
                tracing::debug!("dropping packet with truncated ack section");
                return Ok(());
            }
            self.process_acks(sink, now, latest, mask)?;
        }
        let mut saw_reliable = false;
        while self.state != ConnectionState::Closed && reader.remaining_bits() > 0 {
            let bunch = match Bunch::decode(&mut reader, self.config.max_packet_size) {
                Ok(bunch) => bunch,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed bunch; dropping rest of packet");
                    break;
                }
            };
            saw_reliable |= bunch.reliable;
            self.route_bunch(sink, now, bunch)?;
        }
        if saw_reliable && self.state != ConnectionState::Closed {
            self.ack_pending = true;
        }
        Ok(())
    }

    fn process_acks(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        latest: u16,
        mask: u32,
    ) -> Result<(), ErrorKind> {
        let mut acked = Vec::new();
        if self.in_flight.contains_key(&latest) {
            acked.push(latest);
        }
        for back in 1..=ACK_BITFIELD_BITS {
            if mask & (1 << (back - 1)) != 0 {
                let id = seq_sub(latest, back, PACKET_ID_MODULUS);
                if self.in_flight.contains_key(&id) {
                    acked.push(id);
                }
            }
        }
        for packet_id in acked {
            let info = self.in_flight.remove(&packet_id).expect("membership checked");
            self.metrics.record_acked();
            self.metrics.update_rtt(now.duration_since(info.sent_at));
            for (channel_index, generation) in info.channels {
                self.apply_channel_ack(channel_index, generation, packet_id);
            }
        }
        // Anything the peer's ack history can no longer cover is provably
        // lost: a later id was acked while this one fell off the bitfield.
        let lost: Vec<u16> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&id| {
                best_signed_difference(latest, id, PACKET_ID_MODULUS)
                    > i32::from(ACK_BITFIELD_BITS)
            })
            .collect();
        for packet_id in lost {
            self.handle_lost_packet(sink, now, packet_id)?;
        }
        Ok(())
    }

    fn apply_channel_ack(&mut self, channel_index: u16, generation: u32, packet_id: u16) {
        let i = channel_index as usize;
        if self.generations[i] != generation {
            // Ack for a previous incarnation of this slot.
            return;
        }
        let fully_closed = {
            let Some(ch) = self.channels[i].as_mut() else { return };
            ch.on_packet_acked(packet_id);
            ch.state() == ChannelState::Closed
        };
        if fully_closed {
            self.release_channel(channel_index);
        }
    }

    fn handle_lost_packet(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        packet_id: u16,
    ) -> Result<(), ErrorKind> {
        let Some(info) = self.in_flight.remove(&packet_id) else {
            return Ok(());
        };
        self.metrics.record_lost();
        tracing::debug!(packet_id, "packet presumed lost; retransmitting its reliable bunches");
        for (channel_index, generation) in info.channels {
            let i = channel_index as usize;
            if self.generations[i] != generation {
                continue;
            }
            let sequences = match self.channels[i].as_mut() {
                Some(ch) => ch.on_packet_lost(packet_id),
                None => continue,
            };
            for sequence in sequences {
                let Some((channel_type, open, close, payload)) =
                    self.channels[i].as_ref().and_then(|ch| {
                        ch.retransmit_data(sequence)
                            .map(|(o, c, p)| (ch.channel_type(), o, c, p))
                    })
                else {
                    continue;
                };
                let new_packet_id = self.append_fresh_record(
                    sink,
                    now,
                    channel_index,
                    channel_type,
                    open,
                    close,
                    true,
                    Some(sequence),
                    &payload,
                )?;
                if let Some(ch) = self.channels[i].as_mut() {
                    ch.restamp_packet_id(sequence, new_packet_id);
                }
            }
        }
        Ok(())
    }

    fn route_bunch(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        bunch: Bunch,
    ) -> Result<(), ErrorKind> {
        let channel_index = bunch.channel_index;
        let i = channel_index as usize;
        if i >= self.channels.len() {
            tracing::debug!(channel_index, "dropping bunch beyond the channel table");
            return Ok(());
        }
        if channel_index == CONTROL_CHANNEL_INDEX && bunch.channel_type != ChannelType::Control {
            self.teardown(CloseReason::ProtocolViolation);
            return Ok(());
        }
        if self.role == Role::Server
            && !self.handshake.is_complete()
            && channel_index != CONTROL_CHANNEL_INDEX
        {
            tracing::debug!(channel_index, "dropping pre-handshake bunch");
            return Ok(());
        }
        if self.channels[i].is_none() {
            if !bunch.open {
                // Covers stale retransmissions for an index already closed.
                tracing::debug!(channel_index, "dropping bunch for unknown channel");
                return Ok(());
            }
            self.channels[i] = Some(Channel::new(
                channel_index,
                bunch.channel_type,
                false,
                self.out_reliable[i],
                self.in_reliable[i],
            ));
            self.events.push_back(ConnectionEvent::ChannelOpened {
                channel_index,
                channel_type: bunch.channel_type,
            });
        }
        let received = {
            let ch = self.channels[i].as_mut().expect("channel present");
            if ch.channel_type() != bunch.channel_type {
                tracing::warn!(channel_index, "bunch channel type mismatch");
                ch.mark_broken();
                Err(ErrorKind::Decoding(
                    bunchwire_core::error::DecodingErrorKind::MalformedHeader,
                ))
            } else {
                ch.receive_raw(bunch)
            }
        };
        let deliveries = match received {
            Ok(deliveries) => deliveries,
            Err(_) => {
                // The channel marked itself broken; a broken control
                // channel takes the whole connection with it.
                if channel_index == CONTROL_CHANNEL_INDEX {
                    self.teardown(CloseReason::ProtocolViolation);
                }
                return Ok(());
            }
        };
        for delivered in deliveries {
            self.deliver_bunch(sink, now, channel_index, delivered)?;
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        Ok(())
    }

    fn deliver_bunch(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        channel_index: u16,
        bunch: Bunch,
    ) -> Result<(), ErrorKind> {
        let close = bunch.close;
        if channel_index == CONTROL_CHANNEL_INDEX {
            self.handle_control_payload(sink, now, bunch.payload)?;
        } else if !bunch.payload.is_empty() {
            self.events.push_back(ConnectionEvent::Message {
                channel_index,
                channel_type: bunch.channel_type,
                payload: bunch.payload,
                reliable: bunch.reliable,
            });
        }
        if close && self.state != ConnectionState::Closed {
            if channel_index == CONTROL_CHANNEL_INDEX {
                self.teardown(CloseReason::ExplicitClose);
            } else {
                let done = match self.channels[channel_index as usize].as_mut() {
                    Some(ch) => ch.on_remote_close(),
                    None => false,
                };
                if done {
                    self.release_channel(channel_index);
                }
            }
        }
        Ok(())
    }

    // ===== Control channel =====

    fn handle_control_payload(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        payload: SharedBytes,
    ) -> Result<(), ErrorKind> {
        let total = payload.len() as u64;
        let mut cursor = Cursor::new(payload.as_slice());
        while self.state != ConnectionState::Closed && cursor.position() < total {
            let mut tag_byte = [0u8; 1];
            if cursor.read_exact(&mut tag_byte).is_err() {
                break;
            }
            let tag = tag_byte[0];
            if self.role == Role::Server && !self.handshake.is_complete() {
                self.handle_pre_trust_message(sink, now, tag, &mut cursor)?;
            } else {
                match self.registry.decode(tag, &mut cursor, self.byte_swapping) {
                    Ok(message) => self.dispatch_control(sink, now, message)?,
                    Err(ErrorKind::UnknownTag(tag)) => {
                        tracing::warn!(tag, "unknown control tag; discarding rest of bunch");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "control message failed to decode");
                        self.teardown(CloseReason::ProtocolViolation);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Server-side control handling before the handshake completes: only
    /// Hello and Response act, everything else is skipped by arity.
    fn handle_pre_trust_message(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        tag: u8,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<(), ErrorKind> {
        match tag {
            tags::HELLO => {
                // The magic decides byte order before anything else is
                // trusted, so it is inspected unswapped.
                let Ok(ControlMessage::Hello { magic, version }) =
                    self.registry.decode(tags::HELLO, cursor, false)
                else {
                    self.teardown(CloseReason::HandshakeFailed);
                    return Ok(());
                };
                let version = if magic == HANDSHAKE_MAGIC {
                    version
                } else if magic == HANDSHAKE_MAGIC.swap_bytes() {
                    self.byte_swapping = true;
                    tracing::debug!("peer uses opposite byte order; swapping enabled");
                    version.swap_bytes()
                } else {
                    tracing::warn!(magic, "unrecognized hello magic");
                    self.teardown(CloseReason::HandshakeFailed);
                    return Ok(());
                };
                if version != PROTOCOL_VERSION {
                    let _ = self.send_control(
                        sink,
                        now,
                        ControlMessage::Failure { reason: "protocol version mismatch".into() },
                    );
                    let _ = self.flush(sink, now);
                    self.teardown(CloseReason::HandshakeFailed);
                    return Ok(());
                }
                if let Some(challenge) = self.handshake.on_hello() {
                    self.send_control(sink, now, ControlMessage::Challenge { value: challenge })?;
                    self.flush(sink, now)?;
                }
            }
            tags::RESPONSE => {
                let Ok(ControlMessage::Response { digest }) =
                    self.registry.decode(tags::RESPONSE, cursor, self.byte_swapping)
                else {
                    self.teardown(CloseReason::ProtocolViolation);
                    return Ok(());
                };
                match self.handshake.on_response(digest, self.config.handshake_retry_limit) {
                    ResponseVerdict::Accepted => {
                        self.state = ConnectionState::Open;
                        let session_id = self.session_id;
                        self.send_control(sink, now, ControlMessage::Welcome { session_id })?;
                        self.events.push_back(ConnectionEvent::Connected);
                        self.flush(sink, now)?;
                    }
                    ResponseVerdict::Rejected => {
                        tracing::debug!("challenge response mismatch");
                    }
                    ResponseVerdict::Fatal => {
                        self.teardown(CloseReason::HandshakeFailed);
                    }
                    ResponseVerdict::Ignored => {}
                }
            }
            _ => {
                // Untrusted traffic; consume by arity and ignore.
                if self.registry.discard(tag, cursor, self.byte_swapping).is_err() {
                    tracing::warn!(tag, "undecodable pre-handshake control message");
                    self.teardown(CloseReason::HandshakeFailed);
                }
            }
        }
        Ok(())
    }

    fn dispatch_control(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
        message: ControlMessage,
    ) -> Result<(), ErrorKind> {
        match message {
            // Handshake messages outside their window are stale replays.
            ControlMessage::Hello { .. } | ControlMessage::Response { .. } => {}
            ControlMessage::Challenge { value } => {
                if self.role == Role::Client && self.state == ConnectionState::Pending {
                    let digest = expected_response(value);
                    self.send_control(sink, now, ControlMessage::Response { digest })?;
                    self.flush(sink, now)?;
                }
            }
            ControlMessage::Welcome { session_id } => {
                if self.role == Role::Client && self.state == ConnectionState::Pending {
                    self.session_id = session_id;
                    self.state = ConnectionState::Open;
                    self.events.push_back(ConnectionEvent::Connected);
                }
            }
            ControlMessage::Netspeed { rate } => {
                self.send_rate = rate.clamp(1800, 1_000_000);
                tracing::debug!(rate = self.send_rate, "peer adjusted send rate");
            }
            other => self.events.push_back(ConnectionEvent::Control(other)),
        }
        Ok(())
    }

    // ===== Lifecycle =====

    /// Drives time-based behavior: pacing refill, idle timeout, loss
    /// timeout retransmission, delayed simulated packets, and flushing of
    /// pending acks and partial packets.
    pub fn tick(&mut self, sink: &mut dyn DatagramSink, now: Instant) -> Result<(), ErrorKind> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let burst = Self::burst_bytes(self.send_rate, self.config.max_packet_size);
        let refill = (f64::from(self.send_rate) * elapsed.as_secs_f64()) as i64;
        self.allowance = (self.allowance + refill).min(burst);

        if now.duration_since(self.last_heard) >= self.config.idle_timeout {
            self.teardown(CloseReason::Timeout);
            return Ok(());
        }
        let overdue: Vec<u16> = self
            .in_flight
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= self.config.loss_timeout)
            .map(|(&id, _)| id)
            .collect();
        for packet_id in overdue {
            self.handle_lost_packet(sink, now, packet_id)?;
        }
        if let Some(conditioner) = &mut self.conditioner {
            conditioner.poll(now, sink)?;
        }
        if self.ack_pending && !self.assembler.started() {
            // Nothing outbound carried the acks; send a header-only packet.
            self.begin_packet();
        }
        if self.assembler.started() {
            self.flush(sink, now)?;
        }
        Ok(())
    }

    /// Explicitly closes the connection, notifying the peer best-effort.
    pub fn close(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        // A close bunch on the control channel tells the peer; losing it
        // only costs the peer an idle timeout.
        let _ = self.send_on_channel(sink, now, CONTROL_CHANNEL_INDEX, &[], true, true, false);
        let _ = self.flush(sink, now);
        self.teardown(CloseReason::ExplicitClose);
    }

    fn teardown(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        tracing::debug!(?reason, "connection torn down");
        self.state = ConnectionState::Closed;
        for slot in self.channels.iter_mut() {
            *slot = None;
        }
        self.in_flight.clear();
        self.assembler = PacketAssembler::default();
        self.events.push_back(ConnectionEvent::Closed { reason });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
