// Byte transport under the servo bus
//
// The parser never sleeps or polls; it only sees what `read_until` hands
// back. Anything that can move bytes with a deadline can carry the protocol.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::SessionConfig;

/// A half-duplex byte channel to the servo bus
pub trait Transport: Send {
    /// Drop any bytes waiting in the inbound buffer
    fn clear_input(&mut self) -> io::Result<()>;

    /// Write a whole frame and flush it to the wire
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Block until at least one byte is available or `deadline` passes.
    ///
    /// Returns the number of bytes placed in `buf`; `Ok(0)` means the
    /// deadline passed with nothing received.
    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize>;
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the port named in the config at its baudrate and read timeout
    pub fn open(config: &SessionConfig) -> Result<Self, serialport::Error> {
        let port = serialport::new(&config.port, config.baudrate)
            .timeout(config.timeout)
            .open()?;

        Ok(Self { port })
    }

    /// Wrap an already opened port
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Transport for SerialTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        trace!("TX {:02X?}", frame);
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            // serialport treats a zero timeout as non-blocking
            self.port
                .set_timeout(remaining.max(Duration::from_millis(1)))
                .map_err(io::Error::from)?;

            match self.port.read(buf) {
                Ok(0) => continue,
                Ok(n) => {
                    trace!("RX {:02X?}", &buf[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
