//! Simulated network conditions for local testing.
//!
//! Real networks drop, reorder, and duplicate packets. The
//! [`LinkConditioner`] wraps the outgoing datagram path with a configurable
//! fault model so the reliability machinery can be exercised
//! deterministically: the random source is seeded, so a failing test
//! reproduces. A connection without a `SimulationConfig` never constructs
//! a conditioner and pays nothing for it.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use bunchwire_core::{config::SimulationConfig, transport::DatagramSink};

/// Fault-injecting wrapper around the outgoing datagram path.
#[derive(Debug)]
pub struct LinkConditioner {
    config: SimulationConfig,
    rng: StdRng,
    // Min-heap of (release time, submission order, payload).
    delayed: BinaryHeap<Reverse<(Instant, u64, Vec<u8>)>>,
    submitted: u64,
}

impl LinkConditioner {
    /// Creates a conditioner with the given fault model.
    pub fn new(config: SimulationConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng, delayed: BinaryHeap::new(), submitted: 0 }
    }

    /// Sends one packet through the simulated network: it may be dropped,
    /// duplicated, held back behind later packets, or delayed before
    /// reaching the sink.
    pub fn send(
        &mut self,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn DatagramSink,
    ) -> io::Result<()> {
        if self.rng.random_bool(self.config.loss.clamp(0.0, 1.0)) {
            return Ok(());
        }
        let copies = if self.rng.random_bool(self.config.duplicate.clamp(0.0, 1.0)) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            let mut delay = self.config.lag;
            if !self.config.lag_variance.is_zero() {
                let jitter = self.rng.random_range(0..=self.config.lag_variance.as_micros() as u64);
                delay += Duration::from_micros(jitter);
            }
            if self.rng.random_bool(self.config.reorder.clamp(0.0, 1.0)) {
                delay += self.config.reorder_delay;
            }
            if delay.is_zero() {
                sink.send_datagram(payload)?;
            } else {
                self.submitted += 1;
                self.delayed
                    .push(Reverse((now + delay, self.submitted, payload.to_vec())));
            }
        }
        Ok(())
    }

    /// Releases delayed packets whose time has come.
    pub fn poll(&mut self, now: Instant, sink: &mut dyn DatagramSink) -> io::Result<()> {
        while let Some(Reverse((release_at, _, _))) = self.delayed.peek() {
            if *release_at > now {
                break;
            }
            let Reverse((_, _, payload)) = self.delayed.pop().expect("peeked entry");
            sink.send_datagram(&payload)?;
        }
        Ok(())
    }

    /// Number of packets still held back.
    pub fn pending(&self) -> usize {
        self.delayed.len()
    }
}
