// Numan Thabit 2026
// io/mem.rs - in-memory crossover links for tests and simulation

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;

use super::Link;

#[derive(Debug, Default)]
struct Shared {
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
    severed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    A,
    B,
}

/// One end of an in-memory crossover pair.
///
/// Bytes written on one end surface as reads on the other, like a serial
/// cable with both data wires. Backs the node tests and works for topology
/// simulations without hardware.
#[derive(Debug, Clone)]
pub struct MemLink {
    name: String,
    end: End,
    shared: Arc<Mutex<Shared>>,
}

impl MemLink {
    /// Builds a connected pair; `name_a` and `name_b` label the two ends.
    pub fn pair(name_a: &str, name_b: &str) -> (MemLink, MemLink) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemLink {
                name: name_a.to_string(),
                end: End::A,
                shared: Arc::clone(&shared),
            },
            MemLink {
                name: name_b.to_string(),
                end: End::B,
                shared,
            },
        )
    }

    /// Simulates yanking the cable: both ends fail with `BrokenPipe` from
    /// here on.
    pub fn sever(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.severed = true;
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|_| io::Error::other("crossover pair poisoned"))
    }
}

impl Link for MemLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut shared = self.lock()?;
        if shared.severed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let queue = match self.end {
            End::A => &mut shared.a_to_b,
            End::B => &mut shared.b_to_a,
        };
        queue.extend(frame.iter().copied());
        Ok(())
    }

    fn recv_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut shared = self.lock()?;
        if shared.severed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let queue = match self.end {
            End::A => &mut shared.b_to_a,
            End::B => &mut shared.a_to_b,
        };
        let n = queue.len();
        let (front, back) = queue.as_slices();
        buf.extend_from_slice(front);
        buf.extend_from_slice(back);
        queue.clear();
        Ok(n)
    }
}
