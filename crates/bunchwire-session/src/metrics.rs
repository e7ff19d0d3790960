//! Round-trip time and loss accounting for one connection.

use std::time::Duration;

/// Smoothed link quality measurements.
///
/// RTT samples come from acknowledged packets and are folded in with
/// exponential smoothing; loss counts come from packets declared lost by
/// the ack window or the loss timeout.
#[derive(Debug)]
pub struct LinkMetrics {
    rtt: Duration,
    smoothing: f32,
    packets_sent: u64,
    packets_acked: u64,
    packets_lost: u64,
}

impl LinkMetrics {
    /// Creates metrics with the given RTT smoothing factor (0..1).
    pub fn new(smoothing: f32) -> Self {
        Self {
            rtt: Duration::from_millis(50),
            smoothing: smoothing.clamp(0.01, 1.0),
            packets_sent: 0,
            packets_acked: 0,
            packets_lost: 0,
        }
    }

    /// Current smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Folds one RTT sample into the smoothed estimate.
    pub fn update_rtt(&mut self, sample: Duration) {
        let old = self.rtt.as_secs_f64();
        let new = sample.as_secs_f64();
        let s = f64::from(self.smoothing);
        self.rtt = Duration::from_secs_f64(old + (new - old) * s);
    }

    /// Records one packet handed to the transport.
    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Records one packet confirmed delivered.
    pub fn record_acked(&mut self) {
        self.packets_acked += 1;
    }

    /// Records one packet declared lost.
    pub fn record_lost(&mut self) {
        self.packets_lost += 1;
    }

    /// Fraction of resolved packets that were lost (0.0 to 1.0).
    pub fn loss_rate(&self) -> f32 {
        let resolved = self.packets_acked + self.packets_lost;
        if resolved == 0 {
            0.0
        } else {
            self.packets_lost as f32 / resolved as f32
        }
    }

    /// Total packets handed to the transport.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Total packets declared lost.
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_smoothing_converges() {
        let mut m = LinkMetrics::new(0.5);
        for _ in 0..16 {
            m.update_rtt(Duration::from_millis(100));
        }
        let rtt = m.rtt().as_millis();
        assert!(rtt >= 99 && rtt <= 101, "rtt was {}ms", rtt);
    }

    #[test]
    fn test_loss_rate_counts_resolved_packets_only() {
        let mut m = LinkMetrics::new(0.1);
        assert_eq!(m.loss_rate(), 0.0);
        for _ in 0..9 {
            m.record_acked();
        }
        m.record_lost();
        assert!((m.loss_rate() - 0.1).abs() < f32::EPSILON);
    }
}
