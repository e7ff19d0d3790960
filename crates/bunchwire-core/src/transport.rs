//! Datagram transport boundary.

use std::{collections::VecDeque, io};

/// Unreliable, unordered, message-oriented transport consumed by a
/// connection.
///
/// This trait is the only place actual I/O happens; the protocol core never
/// opens sockets itself and never blocks, so a connection can be driven from
/// a blocking poll loop or an async task alike.
pub trait DatagramSink {
    /// Hands one finished packet to the transport. Delivery is best-effort.
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// In-memory sink collecting datagrams for tests and local loopback wiring.
#[derive(Debug, Default)]
pub struct LoopbackSink {
    queue: VecDeque<Vec<u8>>,
}

impl LoopbackSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all queued datagrams in send order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Returns the number of queued datagrams.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no datagrams are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl DatagramSink for LoopbackSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()> {
        self.queue.push_back(payload.to_vec());
        Ok(())
    }
}
