// Numan Thabit 2026
// io/mod.rs - link abstraction over byte-stream transports

use std::io;

use bytes::BytesMut;

pub mod mem;
#[cfg(feature = "serial")]
pub mod serial;

/// Index of a link in the node's link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

/// A point-to-point byte pipe carrying LINE frames.
///
/// Implementations move raw bytes only: no framing, no retries, no buffering
/// across calls. The node owns frame extraction and the per-link receive
/// buffer; a link just needs to write what it is given and hand over
/// whatever has arrived.
pub trait Link {
    /// Stable human-readable name (the device path for serial ports).
    fn name(&self) -> &str;

    /// Writes one encoded frame.
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Appends every byte currently available to `buf` and returns the
    /// count. Must not block beyond the link's own short read timeout.
    fn recv_into(&mut self, buf: &mut BytesMut) -> io::Result<usize>;
}
