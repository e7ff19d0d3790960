use std::{default::Default, time::Duration};

use crate::constants::{MAX_CHANNELS, MAX_PACKET_DEFAULT};

#[derive(Clone, Debug)]
/// Configuration options to tune connection behavior.
pub struct Config {
    /// Max size of one outgoing packet in bytes, including framing.
    pub max_packet_size: usize,
    /// Max idle time without an incoming packet before the connection is
    /// torn down with a timeout reason.
    pub idle_timeout: Duration,
    /// Number of failed challenge responses tolerated before the handshake
    /// is considered hostile and the connection is torn down.
    pub handshake_retry_limit: u32,
    /// Number of channel slots on this connection (1..=1024). Index 0 is
    /// always the control channel.
    pub max_channels: usize,
    /// Outgoing send budget in bytes per second (fixed-rate pacing).
    pub send_rate: u32,
    /// Age after which an unacknowledged packet is declared lost and its
    /// reliable bunches are retransmitted, even if ack traffic has stalled.
    pub loss_timeout: Duration,
    /// Smoothing factor (0..1) for RTT measurements.
    pub rtt_smoothing_factor: f32,
    /// Optional simulated network conditions applied to the send path.
    /// `None` in production; the conditioner then costs nothing.
    pub simulation: Option<SimulationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_DEFAULT,
            idle_timeout: Duration::from_secs(10),
            handshake_retry_limit: 3,
            max_channels: MAX_CHANNELS,
            send_rate: 20_000,
            loss_timeout: Duration::from_secs(1),
            rtt_smoothing_factor: 0.10,
            simulation: None,
        }
    }
}

/// Simulated network conditions, for local testing only.
///
/// Probabilities are in `[0.0, 1.0]`. The random source is seeded so test
/// failures reproduce.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Probability that an outgoing packet is silently dropped.
    pub loss: f64,
    /// Probability that an outgoing packet is delivered twice.
    pub duplicate: f64,
    /// Probability that an outgoing packet is held back so later packets
    /// overtake it.
    pub reorder: f64,
    /// Hold-back applied to reordered packets.
    pub reorder_delay: Duration,
    /// Fixed extra latency applied to every packet.
    pub lag: Duration,
    /// Upper bound of the random jitter added on top of `lag`.
    pub lag_variance: Duration,
    /// Seed for the fault model's random source.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        // Pass-through by default; individual faults are opted into.
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            reorder_delay: Duration::from_millis(50),
            lag: Duration::ZERO,
            lag_variance: Duration::ZERO,
            seed: 0,
        }
    }
}
