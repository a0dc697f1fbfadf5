// Numan Thabit 2026
// buffer.rs - per-link receive buffer: frame extraction and rot detection

use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::wire::{self, Packet, FRAME_MIN_LEN};

/// Result of a successful frame extraction.
#[derive(Debug)]
pub struct PopOutcome {
    pub packet: Packet,
    /// Junk bytes discarded ahead of the frame.
    pub garbage_bytes: usize,
}

/// Accumulates raw link bytes and surfaces complete frames.
///
/// Serial links deliver bytes with no boundaries. The buffer scans for the
/// preamble, validates candidates, and slides past whatever never becomes a
/// frame. A buffer that holds bytes but has neither received nor produced
/// anything for too long is "rotten" and gets cleared by the owning node.
#[derive(Debug, Default)]
pub struct RxBuffer {
    bytes: BytesMut,
    last_rx: Option<Instant>,
    last_pop: Option<Instant>,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes.
    pub fn extend(&mut self, chunk: &[u8], now: Instant) {
        if chunk.is_empty() {
            return;
        }
        self.bytes.extend_from_slice(chunk);
        self.last_rx = Some(now);
    }

    /// Extracts the first complete frame, discarding junk ahead of it.
    pub fn pop_packet(&mut self, now: Instant) -> Option<PopOutcome> {
        let span = wire::find_frame(&self.bytes)?;

        let garbage_bytes = span.start;
        let _ = self.bytes.split_to(span.start);
        let frame = self.bytes.split_to(span.header.frame_len()).freeze();
        let payload = frame.slice(FRAME_MIN_LEN..);

        self.last_pop = Some(now);
        Some(PopOutcome {
            packet: Packet {
                header: span.header,
                payload,
            },
            garbage_bytes,
        })
    }

    /// True when bytes are stuck: the buffer is non-empty, nothing new
    /// arrived within `rx_idle`, and no frame popped within `pop_idle`.
    pub fn is_rotten(&self, now: Instant, rx_idle: Duration, pop_idle: Duration) -> bool {
        if self.bytes.is_empty() {
            return false;
        }
        age(self.last_rx, now) > rx_idle && age(self.last_pop, now) > pop_idle
    }

    /// Empties the buffer, returning the number of discarded bytes.
    pub fn clear(&mut self) -> usize {
        let n = self.bytes.len();
        self.bytes.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Time since bytes last arrived, if any ever did.
    pub fn rx_idle(&self, now: Instant) -> Option<Duration> {
        self.last_rx.map(|t| now.saturating_duration_since(t))
    }

    /// Time since a frame last popped, if one ever did.
    pub fn pop_idle(&self, now: Instant) -> Option<Duration> {
        self.last_pop.map(|t| now.saturating_duration_since(t))
    }
}

// Never-happened stamps count as infinitely old.
fn age(stamp: Option<Instant>, now: Instant) -> Duration {
    stamp.map_or(Duration::MAX, |t| now.saturating_duration_since(t))
}
