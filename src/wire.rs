// LINE wire format: preamble-delimited frames with a 7-byte XOR-checksummed header.
// Numan Thabit 2026

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Frame start marker on the wire.
pub const PREAMBLE: u8 = 0x69;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 7;

/// Preamble plus header; the minimum bytes a frame candidate needs.
pub const FRAME_MIN_LEN: usize = 1 + HEADER_LEN;

/// Largest payload a frame can carry (the length field is 16 bits).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// First service id reserved for broadcast addressing.
pub const BROADCAST_MIN: u8 = 0xC0;

/// Service identifier carried in the header address fields.
///
/// Ids at or above [`BROADCAST_MIN`] are broadcast addresses: they are never
/// learned by the routing table, and nodes along the path both consume and
/// re-forward packets sent to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u8);

impl ServiceId {
    /// Returns true for broadcast addresses.
    pub const fn is_broadcast(self) -> bool {
        self.0 >= BROADCAST_MIN
    }
}

impl From<u8> for ServiceId {
    fn from(value: u8) -> Self {
        ServiceId(value)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Wire-level error.
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Header checksum did not match the folded header bytes.
    #[error("header checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Payload larger than the 16-bit length field can describe.
    #[error("payload length {0} exceeds u16 range")]
    PayloadTooLong(usize),

    /// Declared payload length exceeds remaining bytes.
    #[error("payload length {declared} exceeds remaining bytes {available}")]
    PayloadUnderrun { declared: usize, available: usize },
}

/// XOR-folds a byte slice into a single checksum byte.
pub fn xor_fold(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Fixed header as carried on the wire, between the preamble and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Destination service.
    pub dst: ServiceId,
    /// Originating service.
    pub src: ServiceId,
    /// Time-to-die: hops consumed so far. Packets die at the configured cap.
    pub ttd: u8,
    /// Payload length in bytes.
    pub payload_len: u16,
}

impl Header {
    /// Encodes the header, computing the trailing checksum byte.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.dst.0;
        buf[1] = self.src.0;
        buf[2] = self.ttd;
        // buf[3] reserved (zero)
        buf[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[6] = xor_fold(&buf[..6]);
        buf
    }

    /// Parses a header from the provided buffer, verifying the checksum.
    ///
    /// The reserved byte participates in the checksum but is otherwise
    /// ignored, so revisions can claim it without breaking older nodes.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::BufferTooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let expected = xor_fold(&bytes[..HEADER_LEN - 1]);
        let actual = bytes[HEADER_LEN - 1];
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let payload_len = u16::from_be_bytes(bytes[4..6].try_into().unwrap());

        Ok(Self {
            dst: ServiceId(bytes[0]),
            src: ServiceId(bytes[1]),
            ttd: bytes[2],
            payload_len,
        })
    }

    /// Total on-wire frame length (preamble + header + payload).
    pub fn frame_len(&self) -> usize {
        FRAME_MIN_LEN + self.payload_len as usize
    }
}

/// A full packet: header plus payload, without the preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header; `payload_len` always matches `payload.len()`.
    pub header: Header,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Packet {
    /// Builds a packet, rejecting payloads the length field cannot describe.
    pub fn new(
        dst: ServiceId,
        src: ServiceId,
        ttd: u8,
        payload: Bytes,
    ) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            header: Header {
                dst,
                src,
                ttd,
                payload_len: payload.len() as u16,
            },
            payload,
        })
    }

    /// True for zero-payload packets (keepalives).
    pub fn is_null(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encodes header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Encodes the on-wire frame: preamble, header, payload.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.frame_len());
        out.push(PREAMBLE);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses a packet (header + payload, no preamble).
    ///
    /// Bytes past the declared payload length are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Header::parse(bytes)?;
        let declared = header.payload_len as usize;
        let available = bytes.len() - HEADER_LEN;
        if available < declared {
            return Err(WireError::PayloadUnderrun {
                declared,
                available,
            });
        }
        let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + declared]);
        Ok(Self { header, payload })
    }
}

/// Location of a complete frame inside a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    /// Offset of the preamble byte; everything before it is junk.
    pub start: usize,
    /// Header parsed from the candidate.
    pub header: Header,
}

impl FrameSpan {
    /// Offset one past the frame's last payload byte.
    pub fn end(&self) -> usize {
        self.start + self.header.frame_len()
    }

    /// Offset of the first payload byte.
    pub fn payload_start(&self) -> usize {
        self.start + FRAME_MIN_LEN
    }
}

/// Scans a buffer for the first complete, checksum-valid frame.
///
/// Candidates whose checksum fails, and candidates whose declared payload has
/// not fully arrived, are stepped over so a later complete frame can still
/// surface behind a stalled or bogus header. Returns `None` when the buffer
/// holds no complete frame.
pub fn find_frame(buf: &[u8]) -> Option<FrameSpan> {
    if buf.len() < FRAME_MIN_LEN {
        return None;
    }

    for start in 0..=buf.len() - FRAME_MIN_LEN {
        if buf[start] != PREAMBLE {
            continue;
        }
        let header = match Header::parse(&buf[start + 1..start + FRAME_MIN_LEN]) {
            Ok(header) => header,
            Err(_) => continue,
        };
        if buf.len() - start >= header.frame_len() {
            return Some(FrameSpan { start, header });
        }
    }

    None
}
