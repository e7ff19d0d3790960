//! Channel lifecycle and per-channel dispatch.
//!
//! A channel is one logical, independently-ordered stream inside a
//! connection. It owns the reliability window for its index and the
//! open/close lifecycle; packet assembly and ack bookkeeping stay with the
//! connection.

use bunchwire_core::error::ErrorKind;
use bunchwire_protocol::{
    bunch::{Bunch, ChannelType},
    reliability::{AckRelease, ReliabilityWindow},
};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opened locally; the open bunch has not been acknowledged yet.
    Opening,
    /// Fully established in both directions.
    Open,
    /// A close bunch is in flight; draining outstanding acks.
    Closing,
    /// Torn down. The slot is free once in-flight acks resolve.
    Closed,
    /// A protocol violation occurred on this channel; it ignores all
    /// further traffic. The connection decides whether that is fatal.
    Broken,
}

impl ChannelState {
    /// Returns true while the channel accepts application sends.
    pub fn can_send(&self) -> bool {
        matches!(self, ChannelState::Opening | ChannelState::Open)
    }

    /// Returns true once the channel stopped processing traffic.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Broken)
    }
}

/// One logical stream within a connection.
#[derive(Debug)]
pub struct Channel {
    index: u16,
    channel_type: ChannelType,
    state: ChannelState,
    opened_locally: bool,
    open_packet_id: Option<u16>,
    open_acked: bool,
    remote_closed: bool,
    window: ReliabilityWindow,
}

impl Channel {
    /// Creates a channel. Locally-opened channels start `Opening` and flag
    /// their first bunch with `open`; remotely-signaled channels are
    /// already established by that first bunch and start `Open`.
    ///
    /// The initial sequence numbers come from the connection's per-index
    /// persistent counters (see the channel-index reuse rule).
    pub fn new(
        index: u16,
        channel_type: ChannelType,
        opened_locally: bool,
        first_outgoing: u16,
        first_expected: u16,
    ) -> Self {
        Self {
            index,
            channel_type,
            state: if opened_locally { ChannelState::Opening } else { ChannelState::Open },
            opened_locally,
            open_packet_id: None,
            open_acked: false,
            remote_closed: false,
            window: ReliabilityWindow::new(first_outgoing, first_expected),
        }
    }

    /// Returns the channel index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Returns the traffic kind of this channel.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Marks the channel broken. It ignores all further traffic.
    pub fn mark_broken(&mut self) {
        self.state = ChannelState::Broken;
    }

    /// Marks the close flag after a close bunch was handed to the
    /// connection.
    pub fn set_closing(&mut self) {
        if !self.state.is_terminal() {
            self.state = ChannelState::Closing;
        }
    }

    /// Returns true if the next outgoing bunch must carry the open flag.
    pub fn needs_open_flag(&self) -> bool {
        self.opened_locally && self.open_packet_id.is_none()
    }

    /// Records the packet id that carried this channel's open bunch.
    pub fn note_open_packet(&mut self, packet_id: u16) {
        if self.open_packet_id.is_none() {
            self.open_packet_id = Some(packet_id);
        }
    }

    /// Whether the peer has acknowledged the open bunch.
    pub fn is_open_acked(&self) -> bool {
        self.open_acked
    }

    /// Number of outgoing reliable bunches awaiting acknowledgement.
    pub fn unacked_len(&self) -> usize {
        self.window.unacked_len()
    }

    /// Reports outgoing capacity. With `saturate` the caller is willing to
    /// fill the window to its hard bound; otherwise a margin is kept.
    pub fn is_send_ready(&self, saturate: bool) -> bool {
        if self.state.is_terminal() || self.state == ChannelState::Closing {
            return false;
        }
        if saturate {
            self.window.unacked_len() < bunchwire_core::constants::RELIABLE_WINDOW
        } else {
            self.window.is_send_ready()
        }
    }

    /// Queues a reliable payload, returning the assigned sequence.
    ///
    /// `WindowFull` marks the channel broken before returning: the peer
    /// has stopped acking and the connection must decide the fallout.
    pub fn enqueue_reliable(
        &mut self,
        open: bool,
        close: bool,
        payload: Vec<u8>,
    ) -> Result<u16, ErrorKind> {
        match self.window.enqueue_outgoing(open, close, payload) {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                tracing::warn!(channel = self.index, "outgoing reliable window overflowed");
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Records the packet id the most recently queued bunch went out in.
    pub fn note_last_packet_id(&mut self, packet_id: u16) {
        self.window.note_last_packet_id(packet_id);
    }

    /// Extends the most recently queued bunch in place (bunch merging).
    pub fn merge_into_last(&mut self, extra: &[u8], close: bool) {
        self.window.merge_into_last(extra, close);
    }

    /// Payload of the most recently queued reliable bunch.
    pub fn last_reliable_payload(&self) -> Option<&[u8]> {
        self.window.last_payload()
    }

    /// Applies a packet acknowledgement to this channel's outgoing queue.
    /// Advances `Opening` to `Open` when the open packet is covered and
    /// `Closing` to `Closed` once the close bunch is confirmed delivered.
    pub fn on_packet_acked(&mut self, packet_id: u16) -> AckRelease {
        if self.open_packet_id == Some(packet_id) {
            self.open_acked = true;
            if self.state == ChannelState::Opening {
                self.state = ChannelState::Open;
            }
        }
        let release = self.window.on_ack(packet_id);
        if self.state == ChannelState::Closing
            && (release.close_released
                || (self.remote_closed && self.window.unacked_len() == 0))
        {
            self.state = ChannelState::Closed;
        }
        release
    }

    /// Returns the sequences that must be retransmitted after losing
    /// `packet_id`.
    pub fn on_packet_lost(&mut self, packet_id: u16) -> Vec<u16> {
        self.window.on_nak(packet_id)
    }

    /// Clones the data needed to re-encode a queued bunch.
    pub fn retransmit_data(&self, sequence: u16) -> Option<(bool, bool, Vec<u8>)> {
        self.window
            .outgoing_by_sequence(sequence)
            .map(|b| (b.open, b.close, b.payload.clone()))
    }

    /// Re-stamps a queued bunch with the packet id of its retransmission.
    pub fn restamp_packet_id(&mut self, sequence: u16, packet_id: u16) {
        self.window.restamp_packet_id(sequence, packet_id);
    }

    /// Processes a raw, possibly out-of-sequence bunch.
    ///
    /// Reliable bunches go through the reorder window; the result is the
    /// in-order run now deliverable to the application. Unreliable bunches
    /// are delivered immediately; the channel does not compensate for
    /// their loss or reordering. A window violation marks the channel
    /// broken and surfaces as an error for the connection to judge.
    pub fn receive_raw(&mut self, bunch: Bunch) -> Result<Vec<Bunch>, ErrorKind> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        if bunch.reliable {
            match self.window.on_incoming(bunch) {
                Ok(run) => Ok(run),
                Err(e) => {
                    tracing::warn!(
                        channel = self.index,
                        error = %e,
                        "reliable sequence violated the reorder window"
                    );
                    self.mark_broken();
                    Err(e)
                }
            }
        } else {
            Ok(vec![bunch])
        }
    }

    /// Handles an in-order close bunch from the peer. Returns true when
    /// the channel can be torn down immediately (no outgoing reliables
    /// left to drain).
    pub fn on_remote_close(&mut self) -> bool {
        self.remote_closed = true;
        if self.window.unacked_len() == 0 {
            self.state = ChannelState::Closed;
            true
        } else {
            self.state = ChannelState::Closing;
            false
        }
    }

    /// Persistent sequence counters handed back to the connection when the
    /// slot is released, so a reused index continues the sequence space.
    pub fn sequence_counters(&self) -> (u16, u16) {
        (self.window.next_outgoing(), self.window.next_expected())
    }
}

/// Builds an unreliable test payload bunch for this channel.
#[cfg(test)]
fn make_bunch(index: u16, reliable: bool, sequence: Option<u16>, payload: &[u8]) -> Bunch {
    use bunchwire_core::shared::SharedBytes;
    Bunch {
        channel_index: index,
        channel_type: ChannelType::Actor,
        open: false,
        close: false,
        reliable,
        sequence,
        payload: SharedBytes::from_vec(payload.to_vec()),
    }
}
