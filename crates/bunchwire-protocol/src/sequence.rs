//! Wraparound-safe sequence arithmetic.
//!
//! Packet ids wrap at 16384 and channel sequences wrap at 1024, so two
//! counters can never be compared with raw `<`/`>`. Every comparison in the
//! protocol goes through [`best_signed_difference`], which maps the shorter
//! circular distance between two values to a signed offset.

use bunchwire_core::constants::{ACK_BITFIELD_BITS, PACKET_ID_MODULUS};

/// Maps the circular distance from `reference` to `value` to a signed
/// offset with magnitude at most `modulus / 2`.
///
/// For all `a`, `b` in `[0, modulus)`:
/// `(b + best_signed_difference(a, b, modulus)) mod modulus == a`.
pub fn best_signed_difference(value: u16, reference: u16, modulus: u16) -> i32 {
    debug_assert!(modulus.is_power_of_two());
    debug_assert!(value < modulus && reference < modulus);
    let m = i32::from(modulus);
    let half = m / 2;
    (i32::from(value) - i32::from(reference) + half).rem_euclid(m) - half
}

/// Returns true if `value` comes after `reference` on the wrapping circle.
pub fn seq_after(value: u16, reference: u16, modulus: u16) -> bool {
    best_signed_difference(value, reference, modulus) > 0
}

/// Advances a wrapping counter by one.
pub fn next_seq(value: u16, modulus: u16) -> u16 {
    (value + 1) % modulus
}

/// Steps a wrapping counter backward by `steps`.
pub fn seq_sub(value: u16, steps: u16, modulus: u16) -> u16 {
    (value + modulus - (steps % modulus)) % modulus
}

/// Outcome of observing an incoming packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketObservation {
    /// First sighting of this packet id.
    Fresh,
    /// Seen before, or too old for the tracking window to tell. Drop it.
    Duplicate,
}

/// Tracks recently received packet ids and produces the cumulative ack
/// information carried in every outgoing packet header: the latest received
/// id plus a bitfield covering the 32 ids before it.
#[derive(Debug, Default)]
pub struct ReceivedPacketTracker {
    latest: u16,
    mask: u32,
    initialized: bool,
}

impl ReceivedPacketTracker {
    /// Creates a tracker that has seen no packets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an incoming packet id, reporting whether it is new.
    pub fn observe(&mut self, packet_id: u16) -> PacketObservation {
        if !self.initialized {
            self.initialized = true;
            self.latest = packet_id;
            self.mask = 0;
            return PacketObservation::Fresh;
        }
        let diff = best_signed_difference(packet_id, self.latest, PACKET_ID_MODULUS);
        if diff > 0 {
            // New latest; shift history and record the previous latest.
            let shift = diff as u32;
            self.mask = if shift > u32::from(ACK_BITFIELD_BITS) {
                0
            } else {
                self.mask.checked_shl(shift).unwrap_or(0) | 1 << (shift - 1)
            };
            self.latest = packet_id;
            PacketObservation::Fresh
        } else if diff == 0 {
            PacketObservation::Duplicate
        } else {
            let back = (-diff) as u32;
            if back > u32::from(ACK_BITFIELD_BITS) {
                // Beyond the history window; cannot distinguish, so drop.
                return PacketObservation::Duplicate;
            }
            let bit = 1u32 << (back - 1);
            if self.mask & bit != 0 {
                PacketObservation::Duplicate
            } else {
                self.mask |= bit;
                PacketObservation::Fresh
            }
        }
    }

    /// Returns `(latest_received_id, ack_bitfield)` for the next outgoing
    /// packet header, or `None` before any packet has been received. Bit
    /// `i` of the bitfield covers id `latest - (i + 1)`.
    pub fn ack_info(&self) -> Option<(u16, u32)> {
        self.initialized.then_some((self.latest, self.mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bunchwire_core::constants::CHANNEL_SEQUENCE_MODULUS;
    use proptest::prelude::*;

    #[test]
    fn test_signed_difference_basics() {
        assert_eq!(best_signed_difference(5, 3, 16384), 2);
        assert_eq!(best_signed_difference(3, 5, 16384), -2);
        assert_eq!(best_signed_difference(7, 7, 16384), 0);
        // Across the wrap point the short way wins.
        assert_eq!(best_signed_difference(1, 16383, 16384), 2);
        assert_eq!(best_signed_difference(16383, 1, 16384), -2);
        assert_eq!(best_signed_difference(0, 1023, 1024), 1);
    }

    #[test]
    fn test_seq_helpers() {
        assert_eq!(next_seq(1023, CHANNEL_SEQUENCE_MODULUS), 0);
        assert_eq!(seq_sub(0, 1, CHANNEL_SEQUENCE_MODULUS), 1023);
        assert!(seq_after(0, 1023, 1024));
        assert!(!seq_after(1023, 0, 1024));
    }

    proptest! {
        #[test]
        fn prop_difference_round_trips(a in 0u16..16384, b in 0u16..16384) {
            let d = best_signed_difference(a, b, 16384);
            let back = (i32::from(b) + d).rem_euclid(16384) as u16;
            prop_assert_eq!(back, a);
            prop_assert!(d.abs() <= 8192);
        }

        #[test]
        fn prop_difference_round_trips_small_modulus(a in 0u16..1024, b in 0u16..1024) {
            let d = best_signed_difference(a, b, 1024);
            let back = (i32::from(b) + d).rem_euclid(1024) as u16;
            prop_assert_eq!(back, a);
            prop_assert!(d.abs() <= 512);
        }
    }

    #[test]
    fn test_tracker_reports_latest_and_history() {
        let mut t = ReceivedPacketTracker::new();
        assert_eq!(t.ack_info(), None);

        assert_eq!(t.observe(10), PacketObservation::Fresh);
        assert_eq!(t.observe(11), PacketObservation::Fresh);
        assert_eq!(t.observe(13), PacketObservation::Fresh);

        let (latest, mask) = t.ack_info().unwrap();
        assert_eq!(latest, 13);
        // 12 missing, 11 and 10 received.
        assert_eq!(mask & 0b111, 0b110);
    }

    #[test]
    fn test_tracker_detects_duplicates() {
        let mut t = ReceivedPacketTracker::new();
        t.observe(5);
        t.observe(7);
        assert_eq!(t.observe(7), PacketObservation::Duplicate);
        assert_eq!(t.observe(5), PacketObservation::Duplicate);
        // 6 was never seen; late arrival is fresh.
        assert_eq!(t.observe(6), PacketObservation::Fresh);
        assert_eq!(t.observe(6), PacketObservation::Duplicate);
    }

    #[test]
    fn test_tracker_wraparound() {
        let mut t = ReceivedPacketTracker::new();
        t.observe(16382);
        t.observe(16383);
        assert_eq!(t.observe(0), PacketObservation::Fresh);
        assert_eq!(t.observe(1), PacketObservation::Fresh);
        let (latest, mask) = t.ack_info().unwrap();
        assert_eq!(latest, 1);
        assert_eq!(mask & 0b111, 0b111);
        assert_eq!(t.observe(16383), PacketObservation::Duplicate);
    }

    #[test]
    fn test_tracker_too_old_is_duplicate() {
        let mut t = ReceivedPacketTracker::new();
        t.observe(100);
        assert_eq!(t.observe(50), PacketObservation::Duplicate);
    }

    #[test]
    fn test_tracker_large_jump_clears_history() {
        let mut t = ReceivedPacketTracker::new();
        t.observe(1);
        t.observe(2);
        t.observe(200);
        let (latest, mask) = t.ack_info().unwrap();
        assert_eq!(latest, 200);
        assert_eq!(mask, 0);
    }
}
