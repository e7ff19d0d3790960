//! Per-channel reliable delivery windows.
//!
//! One `ReliabilityWindow` serves both directions of a single channel: it
//! queues outgoing reliable bunches until the packet that carried them is
//! acknowledged, and buffers incoming reliable bunches that arrived ahead
//! of sequence until the gap is filled. Delivery order is defined strictly
//! by channel sequence, never by arrival order or packet id.

use std::collections::VecDeque;

use bunchwire_core::{
    constants::{CHANNEL_SEQUENCE_MODULUS, RELIABLE_WINDOW},
    error::ErrorKind,
};

use crate::{
    bunch::Bunch,
    sequence::{best_signed_difference, next_seq},
};

/// A reliable bunch queued until its packet is acknowledged.
#[derive(Debug, Clone)]
pub struct OutgoingReliable {
    /// Channel-local sequence number; never changes across retransmissions.
    pub sequence: u16,
    /// Physical packet this bunch was last sent in.
    pub packet_id: u16,
    /// Open flag carried by the bunch.
    pub open: bool,
    /// Close flag carried by the bunch.
    pub close: bool,
    /// Payload bytes, owned so retransmission and merging can reuse them.
    pub payload: Vec<u8>,
    acked: bool,
}

/// Result of applying a packet acknowledgement to the outgoing queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckRelease {
    /// Number of bunches released from the front of the queue.
    pub released: usize,
    /// Whether a released bunch carried the close flag.
    pub close_released: bool,
}

/// Exactly-once, in-order delivery state for one channel.
#[derive(Debug)]
pub struct ReliabilityWindow {
    next_outgoing: u16,
    next_expected: u16,
    outgoing: VecDeque<OutgoingReliable>,
    incoming: VecDeque<Bunch>,
}

impl ReliabilityWindow {
    /// Creates a window with the given initial sequence numbers. These come
    /// from the connection's per-index persistent counters so a reused
    /// channel index continues the sequence space of its predecessor.
    pub fn new(first_outgoing: u16, first_expected: u16) -> Self {
        Self {
            next_outgoing: first_outgoing,
            next_expected: first_expected,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
        }
    }

    /// Sequence number the next outgoing bunch will be assigned.
    pub fn next_outgoing(&self) -> u16 {
        self.next_outgoing
    }

    /// Sequence number of the next in-order incoming bunch.
    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    /// Number of outgoing bunches awaiting acknowledgement.
    pub fn unacked_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Returns true while the queue has room to accept another send without
    /// approaching the window bound.
    pub fn is_send_ready(&self) -> bool {
        self.outgoing.len() < RELIABLE_WINDOW - 1
    }

    /// Assigns the next sequence number and queues the bunch for
    /// retransmission tracking.
    ///
    /// `WindowFull` means the peer has stopped acknowledging: fatal for the
    /// channel, not retryable.
    pub fn enqueue_outgoing(
        &mut self,
        open: bool,
        close: bool,
        payload: Vec<u8>,
    ) -> Result<u16, ErrorKind> {
        if self.outgoing.len() >= RELIABLE_WINDOW {
            return Err(ErrorKind::WindowFull);
        }
        let sequence = self.next_outgoing;
        self.next_outgoing = next_seq(self.next_outgoing, CHANNEL_SEQUENCE_MODULUS);
        self.outgoing.push_back(OutgoingReliable {
            sequence,
            packet_id: 0,
            open,
            close,
            payload,
            acked: false,
        });
        Ok(sequence)
    }

    /// Records the packet id the most recently queued bunch was written to.
    pub fn note_last_packet_id(&mut self, packet_id: u16) {
        if let Some(last) = self.outgoing.back_mut() {
            last.packet_id = packet_id;
        }
    }

    /// Extends the most recently queued bunch in place, keeping its
    /// sequence number. Used when the connection merges a send into the
    /// last unflushed bunch.
    pub fn merge_into_last(&mut self, extra: &[u8], close: bool) {
        if let Some(last) = self.outgoing.back_mut() {
            last.payload.extend_from_slice(extra);
            last.close |= close;
        }
    }

    /// Payload of the most recently queued bunch, for re-encoding a merged
    /// record.
    pub fn last_payload(&self) -> Option<&[u8]> {
        self.outgoing.back().map(|b| b.payload.as_slice())
    }

    /// Applies a cumulative packet acknowledgement: marks every queued
    /// bunch sent in `packet_id` as delivered, then releases the acked
    /// prefix of the queue in sequence order.
    pub fn on_ack(&mut self, packet_id: u16) -> AckRelease {
        for bunch in self.outgoing.iter_mut() {
            if bunch.packet_id == packet_id {
                bunch.acked = true;
            }
        }
        let mut release = AckRelease::default();
        while let Some(front) = self.outgoing.front() {
            if !front.acked {
                break;
            }
            let released = self.outgoing.pop_front().expect("front exists");
            release.released += 1;
            release.close_released |= released.close;
        }
        release
    }

    /// Returns the sequences of still-unacked bunches sent in the lost
    /// packet. Retransmission reuses the same sequence under a new packet
    /// id.
    pub fn on_nak(&mut self, packet_id: u16) -> Vec<u16> {
        self.outgoing
            .iter()
            .filter(|b| b.packet_id == packet_id && !b.acked)
            .map(|b| b.sequence)
            .collect()
    }

    /// Looks up a queued bunch by sequence for retransmission.
    pub fn outgoing_by_sequence(&self, sequence: u16) -> Option<&OutgoingReliable> {
        self.outgoing.iter().find(|b| b.sequence == sequence)
    }

    /// Re-stamps the packet id of a queued bunch after retransmission.
    pub fn restamp_packet_id(&mut self, sequence: u16, packet_id: u16) {
        if let Some(bunch) = self.outgoing.iter_mut().find(|b| b.sequence == sequence) {
            bunch.packet_id = packet_id;
        }
    }

    /// Processes an incoming reliable bunch.
    ///
    /// In-sequence bunches come back immediately together with any buffered
    /// bunches that are now contiguous; ahead-of-sequence bunches are
    /// buffered; already-delivered sequences are silently discarded. A
    /// sequence further ahead than the window, or a reorder buffer that
    /// would exceed the window, is a protocol violation and fatal for the
    /// channel.
    pub fn on_incoming(&mut self, bunch: Bunch) -> Result<Vec<Bunch>, ErrorKind> {
        let sequence = bunch.sequence.expect("reliable bunch carries a sequence");
        let diff = best_signed_difference(sequence, self.next_expected, CHANNEL_SEQUENCE_MODULUS);
        if diff < 0 {
            // Already delivered; duplicate from retransmission.
            return Ok(Vec::new());
        }
        if diff > 0 {
            if diff as usize >= RELIABLE_WINDOW || self.incoming.len() >= RELIABLE_WINDOW {
                return Err(ErrorKind::WindowViolation);
            }
            // Insert sorted by sequence distance, dropping duplicates.
            let mut at = self.incoming.len();
            for (i, queued) in self.incoming.iter().enumerate() {
                let queued_seq = queued.sequence.expect("buffered bunch is reliable");
                let queued_diff = best_signed_difference(
                    queued_seq,
                    self.next_expected,
                    CHANNEL_SEQUENCE_MODULUS,
                );
                if queued_diff == diff {
                    return Ok(Vec::new());
                }
                if queued_diff > diff {
                    at = i;
                    break;
                }
            }
            self.incoming.insert(at, bunch);
            return Ok(Vec::new());
        }
        // In sequence: deliver it plus any now-contiguous buffered bunches.
        let mut delivered = vec![bunch];
        self.next_expected = next_seq(self.next_expected, CHANNEL_SEQUENCE_MODULUS);
        while let Some(front) = self.incoming.front() {
            if front.sequence != Some(self.next_expected) {
                break;
            }
            let released = self.incoming.pop_front().expect("front exists");
            self.next_expected = next_seq(self.next_expected, CHANNEL_SEQUENCE_MODULUS);
            delivered.push(released);
        }
        Ok(delivered)
    }
}

/// Builds a reliable test bunch on channel `index` with the given sequence.
#[cfg(test)]
fn test_bunch(index: u16, sequence: u16, payload: &[u8]) -> Bunch {
    use crate::bunch::ChannelType;
    use bunchwire_core::shared::SharedBytes;
    Bunch {
        channel_index: index,
        channel_type: ChannelType::Actor,
        open: false,
        close: false,
        reliable: true,
        sequence: Some(sequence),
        payload: SharedBytes::from_vec(payload.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery_passes_through() {
        let mut window = ReliabilityWindow::new(0, 0);
        for seq in 0..4 {
            let out = window.on_incoming(test_bunch(2, seq, b"x")).unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].sequence, Some(seq));
        }
    }

    #[test]
    fn test_out_of_order_delivery_reorders() {
        let mut window = ReliabilityWindow::new(0, 0);
        // Arrival permutation 2, 0, 3, 1 of sequences 0..4.
        assert!(window.on_incoming(test_bunch(2, 2, b"c")).unwrap().is_empty());
        let first = window.on_incoming(test_bunch(2, 0, b"a")).unwrap();
        assert_eq!(first.iter().map(|b| b.sequence.unwrap()).collect::<Vec<_>>(), vec![0]);
        assert!(window.on_incoming(test_bunch(2, 3, b"d")).unwrap().is_empty());
        let rest = window.on_incoming(test_bunch(2, 1, b"b")).unwrap();
        assert_eq!(rest.iter().map(|b| b.sequence.unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicates_are_discarded() {
        let mut window = ReliabilityWindow::new(0, 0);
        assert_eq!(window.on_incoming(test_bunch(2, 0, b"a")).unwrap().len(), 1);
        // Delivered sequence replayed any number of times: nothing comes out.
        for _ in 0..3 {
            assert!(window.on_incoming(test_bunch(2, 0, b"a")).unwrap().is_empty());
        }
        // A buffered ahead-of-sequence duplicate is also dropped.
        assert!(window.on_incoming(test_bunch(2, 2, b"c")).unwrap().is_empty());
        assert!(window.on_incoming(test_bunch(2, 2, b"c")).unwrap().is_empty());
        let out = window.on_incoming(test_bunch(2, 1, b"b")).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_delivery_across_sequence_wrap() {
        let start = CHANNEL_SEQUENCE_MODULUS - 2;
        let mut window = ReliabilityWindow::new(0, start);
        let seqs = [start, start + 1, 0, 1];
        let mut delivered = Vec::new();
        for seq in seqs {
            delivered.extend(
                window
                    .on_incoming(test_bunch(2, seq, b"x"))
                    .unwrap()
                    .into_iter()
                    .map(|b| b.sequence.unwrap()),
            );
        }
        assert_eq!(delivered, vec![start, start + 1, 0, 1]);
    }

    #[test]
    fn test_sequence_gap_beyond_window_is_violation() {
        let mut window = ReliabilityWindow::new(0, 0);
        let too_far = RELIABLE_WINDOW as u16;
        assert!(matches!(
            window.on_incoming(test_bunch(2, too_far, b"x")),
            Err(ErrorKind::WindowViolation)
        ));
    }

    #[test]
    fn test_window_overflow_is_fatal_not_silent() {
        let mut window = ReliabilityWindow::new(0, 0);
        for _ in 0..RELIABLE_WINDOW {
            window.enqueue_outgoing(false, false, b"x".to_vec()).unwrap();
        }
        assert!(matches!(
            window.enqueue_outgoing(false, false, b"x".to_vec()),
            Err(ErrorKind::WindowFull)
        ));
        assert!(!window.is_send_ready());
    }

    #[test]
    fn test_ack_releases_every_bunch_in_packet() {
        let mut window = ReliabilityWindow::new(0, 0);
        for _ in 0..3 {
            window.enqueue_outgoing(false, false, b"x".to_vec()).unwrap();
            window.note_last_packet_id(7);
        }
        window.enqueue_outgoing(false, false, b"y".to_vec()).unwrap();
        window.note_last_packet_id(8);

        let release = window.on_ack(7);
        assert_eq!(release.released, 3);
        assert_eq!(window.unacked_len(), 1);
        // The remaining bunch keeps its sequence.
        assert_eq!(window.outgoing_by_sequence(3).unwrap().packet_id, 8);
    }

    #[test]
    fn test_out_of_order_ack_releases_in_sequence_order() {
        let mut window = ReliabilityWindow::new(0, 0);
        window.enqueue_outgoing(false, false, b"a".to_vec()).unwrap();
        window.note_last_packet_id(1);
        window.enqueue_outgoing(false, false, b"b".to_vec()).unwrap();
        window.note_last_packet_id(2);

        // Packet 2 acked first: nothing releases until packet 1 is acked.
        assert_eq!(window.on_ack(2).released, 0);
        assert_eq!(window.unacked_len(), 2);
        let release = window.on_ack(1);
        assert_eq!(release.released, 2);
    }

    #[test]
    fn test_nak_requeues_with_same_sequences() {
        let mut window = ReliabilityWindow::new(0, 0);
        for _ in 0..2 {
            window.enqueue_outgoing(false, false, b"x".to_vec()).unwrap();
            window.note_last_packet_id(5);
        }
        let lost = window.on_nak(5);
        assert_eq!(lost, vec![0, 1]);
        for seq in lost {
            window.restamp_packet_id(seq, 9);
        }
        assert_eq!(window.outgoing_by_sequence(0).unwrap().packet_id, 9);
        assert_eq!(window.outgoing_by_sequence(1).unwrap().packet_id, 9);
        // Sequences unchanged, nothing released.
        assert_eq!(window.unacked_len(), 2);
        // The ack for the retransmission releases both.
        assert_eq!(window.on_ack(9).released, 2);
    }

    #[test]
    fn test_close_release_is_reported() {
        let mut window = ReliabilityWindow::new(0, 0);
        window.enqueue_outgoing(false, true, Vec::new()).unwrap();
        window.note_last_packet_id(3);
        let release = window.on_ack(3);
        assert!(release.close_released);
    }

    #[test]
    fn test_merge_extends_last_queued_payload() {
        let mut window = ReliabilityWindow::new(0, 0);
        window.enqueue_outgoing(false, false, b"ab".to_vec()).unwrap();
        window.merge_into_last(b"cd", false);
        assert_eq!(window.last_payload().unwrap(), b"abcd");
        // Still one queued bunch under one sequence.
        assert_eq!(window.unacked_len(), 1);
        assert_eq!(window.next_outgoing(), 1);
    }
}
