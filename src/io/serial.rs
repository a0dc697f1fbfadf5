// Numan Thabit 2026
// io/serial.rs - serial device links via the serialport crate

use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::BytesMut;
use serialport::SerialPort;

use super::Link;
use crate::config::Config;

/// A LINE link over a serial device.
///
/// The port is opened with a short read timeout so the node's polling reads
/// can never stall a tick; `recv_into` additionally asks the driver how many
/// bytes are already buffered and reads no more than that.
pub struct SerialLink {
    name: String,
    port: Box<dyn SerialPort>,
    scratch: Vec<u8>,
}

impl SerialLink {
    /// Opens `path` at `baud_rate`, reading at most `read_chunk` bytes per
    /// poll.
    pub fn open(
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
        read_chunk: usize,
    ) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Self {
            name: path.to_string(),
            port,
            scratch: vec![0u8; read_chunk.max(1)],
        })
    }

    /// Opens every device named in the configuration, in order.
    pub fn open_all(config: &Config) -> io::Result<Vec<SerialLink>> {
        config
            .node
            .devices
            .iter()
            .map(|path| {
                Self::open(
                    path,
                    config.serial.baud_rate,
                    config.serial.read_timeout(),
                    config.serial.read_chunk,
                )
            })
            .collect()
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)
    }

    fn recv_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available == 0 {
            return Ok(0);
        }

        let want = available.min(self.scratch.len());
        let n = match self.port.read(&mut self.scratch[..want]) {
            Ok(n) => n,
            // The driver drained between the poll and the read.
            Err(err) if err.kind() == io::ErrorKind::TimedOut => 0,
            Err(err) => return Err(err),
        };
        buf.extend_from_slice(&self.scratch[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_missing_device() {
        let err = SerialLink::open(
            "/dev/lineport-test-does-not-exist",
            9600,
            Duration::from_millis(50),
            4096,
        );
        assert!(err.is_err());
    }
}
