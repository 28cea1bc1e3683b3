// Servo bus session and instruction API
//
// Every call is one synchronous cycle: encode -> clear input -> write ->
// parse replies until the deadline. The bus is strictly half-duplex, so a
// session needs `&mut self` for each cycle; share it across threads through
// `SharedBus`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::error::{ErrorFlags, Outcome, Result, ServoError};
use super::packet::{
    self, BROADCAST_ID, Instruction, MAX_ID, Signedness, decode_word, encode_word,
    encode_word_value,
};
use super::parser::{ResponseParser, StatusPacket, Step};
use super::transport::{SerialTransport, Transport};
use crate::config::SessionConfig;

/// One session on a servo bus
pub struct ServoBus {
    config: SessionConfig,
    transport: Option<Box<dyn Transport>>,
}

impl ServoBus {
    /// Create a closed session; call [`ServoBus::connect`] before use
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Create and connect in one step
    pub fn open(config: SessionConfig) -> Result<Self> {
        let mut bus = Self::new(config);
        bus.connect()?;
        Ok(bus)
    }

    /// Run a session over an already connected transport (simulator, test rig)
    pub fn with_transport(config: SessionConfig, transport: impl Transport + 'static) -> Self {
        Self {
            config,
            transport: Some(Box::new(transport)),
        }
    }

    /// Open the serial port. No-op when already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        info!(
            "Opening servo bus on {} at {} baud",
            self.config.port, self.config.baudrate
        );
        let transport =
            SerialTransport::open(&self.config).map_err(|source| ServoError::Connection {
                port: self.config.port.clone(),
                source,
            })?;
        self.transport = Some(Box::new(transport));
        Ok(())
    }

    /// Close the port. Safe to call on a closed session.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("Closed servo bus on {}", self.config.port);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Change the per-instruction reply timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(ServoError::NotConnected)
    }

    /// Clear stale input, then write the frame
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let transport = self.transport()?;
        transport.clear_input()?;
        transport.write_frame(frame)?;
        Ok(())
    }

    /// Parse replies until a valid frame for `id` arrives or the timeout
    /// (measured from the start of the read) elapses.
    fn read_response(&mut self, id: u8) -> Result<Outcome<StatusPacket>> {
        let deadline = Instant::now() + self.config.timeout;
        let transport = self.transport()?;
        let mut parser = ResponseParser::new(id);
        let mut buf = [0u8; 64];

        loop {
            let n = transport.read_until(&mut buf, deadline)?;
            if n == 0 {
                break;
            }
            if let (_, Step::Complete(status)) = parser.feed(&buf[..n]) {
                return Ok(Outcome::Value(status));
            }
        }

        debug!("No reply from motor {} ({:?})", id, parser.finish());
        if parser.mismatches() > 0 {
            Ok(Outcome::ChecksumMismatch)
        } else {
            Ok(Outcome::TimedOut)
        }
    }

    /// Send one instruction and wait for its status packet
    fn transact(
        &mut self,
        id: u8,
        instruction: Instruction,
        params: &[u8],
    ) -> Result<Outcome<StatusPacket>> {
        let frame = packet::encode(id, instruction, params)?;
        self.send_frame(&frame)?;
        self.read_response(id)
    }

    /// Ping a servo to check if it's connected
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        let reply = self.transact(id, Instruction::Ping, &[])?;
        Ok(reply.is_value())
    }

    /// Ping and return the status error bits the servo reports
    pub fn status(&mut self, id: u8) -> Result<Outcome<ErrorFlags>> {
        let reply = self.transact(id, Instruction::Ping, &[])?;
        Ok(reply.map(|status| ErrorFlags::from(status.error)))
    }

    /// Read `len` bytes starting at `register`
    pub fn read(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        len: u8,
    ) -> Result<Outcome<Vec<u8>>> {
        let register = register.into();
        let reply = self.transact(id, Instruction::Read, &[register, len])?;
        Ok(reply.and_then(|status| {
            if status.params.len() == len as usize {
                Outcome::Value(status.params)
            } else {
                debug!(
                    "Motor {} returned {} bytes for reg {}, expected {}",
                    id,
                    status.params.len(),
                    register,
                    len
                );
                Outcome::Malformed
            }
        }))
    }

    /// Read a single byte from a register
    pub fn read_byte(&mut self, id: u8, register: impl Into<u8>) -> Result<Outcome<u8>> {
        Ok(self.read(id, register, 1)?.map(|bytes| bytes[0]))
    }

    /// Read two bytes (little-endian) from a register
    pub fn read_word(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        signedness: Signedness,
    ) -> Result<Outcome<i32>> {
        let reply = self.read(id, register, 2)?;
        Ok(reply.map(|bytes| decode_word([bytes[0], bytes[1]], signedness)))
    }

    pub fn read_word_unsigned(&mut self, id: u8, register: impl Into<u8>) -> Result<Outcome<u16>> {
        Ok(self
            .read_word(id, register, Signedness::Unsigned)?
            .map(|v| v as u16))
    }

    pub fn read_word_signed(&mut self, id: u8, register: impl Into<u8>) -> Result<Outcome<i16>> {
        Ok(self
            .read_word(id, register, Signedness::Signed)?
            .map(|v| v as i16))
    }

    /// Write raw bytes starting at `register`; yields the status error byte
    pub fn write(&mut self, id: u8, register: impl Into<u8>, data: &[u8]) -> Result<Outcome<u8>> {
        let register = register.into();
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(register);
        params.extend_from_slice(data);
        debug!(
            "Write to motor {}: reg={}, data={:02X?}",
            id, register, data
        );

        let reply = self.transact(id, Instruction::Write, &params)?;
        Ok(reply.map(|status| status.error))
    }

    /// Write a single byte to a register
    pub fn write_byte(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        value: u8,
    ) -> Result<Outcome<u8>> {
        self.write(id, register, &[value])
    }

    /// Write two bytes (little-endian) to a register
    pub fn write_word(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        value: u16,
    ) -> Result<Outcome<u8>> {
        self.write(id, register, &encode_word(value))
    }

    /// Write a two's complement word, e.g. a negative homing offset
    pub fn write_word_signed(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        value: i16,
    ) -> Result<Outcome<u8>> {
        self.write_word_value(id, register, value.into(), Signedness::Signed)
    }

    /// Write a word given in either interpretation.
    ///
    /// A value outside the range of `signedness` is rejected before anything
    /// is sent, with [`ServoError::Packet`].
    pub fn write_word_value(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        value: i32,
        signedness: Signedness,
    ) -> Result<Outcome<u8>> {
        let bytes = encode_word_value(value, signedness)?;
        self.write(id, register, &bytes)
    }

    /// Stage a write that takes effect on the next [`ServoBus::action`]
    pub fn reg_write(
        &mut self,
        id: u8,
        register: impl Into<u8>,
        data: &[u8],
    ) -> Result<Outcome<u8>> {
        let register = register.into();
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(register);
        params.extend_from_slice(data);
        debug!(
            "Reg write to motor {}: reg={}, data={:02X?}",
            id, register, data
        );

        let reply = self.transact(id, Instruction::RegWrite, &params)?;
        Ok(reply.map(|status| status.error))
    }

    /// Commit staged writes. The broadcast id gets no reply.
    pub fn action(&mut self, id: u8) -> Result<Outcome<u8>> {
        if id == BROADCAST_ID {
            let frame = packet::encode(id, Instruction::Action, &[])?;
            self.send_frame(&frame)?;
            return Ok(Outcome::Value(0));
        }
        let reply = self.transact(id, Instruction::Action, &[])?;
        Ok(reply.map(|status| status.error))
    }

    /// Ping every id in `start..=end` (clamped to the device id range) and
    /// return the responders in ascending order.
    ///
    /// Each silent id costs one full timeout.
    pub fn scan(&mut self, start: u8, end: u8) -> Result<Vec<u8>> {
        let end = end.min(MAX_ID);
        let mut found = Vec::new();
        if start > end {
            return Ok(found);
        }

        info!("Scanning ids {}..={} on {}", start, end, self.config.port);
        for id in start..=end {
            if self.ping(id)? {
                debug!("Found motor {}", id);
                found.push(id);
            }
        }
        info!("Scan found {} motor(s): {:?}", found.len(), found);
        Ok(found)
    }
}

/// Cloneable, thread-safe handle to one session.
///
/// Each method holds the lock for a full request/response cycle, so two
/// threads never interleave bytes on the wire. Anything not forwarded here
/// (`read`, `write`, `connect`, ...) is reachable through [`SharedBus::lock`].
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<ServoBus>>,
}

impl SharedBus {
    pub fn new(bus: ServoBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    /// Exclusive access for a multi-step sequence (e.g. unlock, write, lock)
    pub fn lock(&self) -> MutexGuard<'_, ServoBus> {
        // Every cycle clears stale input first, so a poisoned session is usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ping(&self, id: u8) -> Result<bool> {
        self.lock().ping(id)
    }

    pub fn status(&self, id: u8) -> Result<Outcome<ErrorFlags>> {
        self.lock().status(id)
    }

    pub fn read_byte(&self, id: u8, register: impl Into<u8>) -> Result<Outcome<u8>> {
        self.lock().read_byte(id, register)
    }

    pub fn read_word(
        &self,
        id: u8,
        register: impl Into<u8>,
        signedness: Signedness,
    ) -> Result<Outcome<i32>> {
        self.lock().read_word(id, register, signedness)
    }

    pub fn read_word_unsigned(&self, id: u8, register: impl Into<u8>) -> Result<Outcome<u16>> {
        self.lock().read_word_unsigned(id, register)
    }

    pub fn read_word_signed(&self, id: u8, register: impl Into<u8>) -> Result<Outcome<i16>> {
        self.lock().read_word_signed(id, register)
    }

    pub fn write_byte(&self, id: u8, register: impl Into<u8>, value: u8) -> Result<Outcome<u8>> {
        self.lock().write_byte(id, register, value)
    }

    pub fn write_word(&self, id: u8, register: impl Into<u8>, value: u16) -> Result<Outcome<u8>> {
        self.lock().write_word(id, register, value)
    }

    pub fn write_word_signed(
        &self,
        id: u8,
        register: impl Into<u8>,
        value: i16,
    ) -> Result<Outcome<u8>> {
        self.lock().write_word_signed(id, register, value)
    }

    pub fn reg_write(&self, id: u8, register: impl Into<u8>, data: &[u8]) -> Result<Outcome<u8>> {
        self.lock().reg_write(id, register, data)
    }

    pub fn action(&self, id: u8) -> Result<Outcome<u8>> {
        self.lock().action(id)
    }

    pub fn scan(&self, start: u8, end: u8) -> Result<Vec<u8>> {
        self.lock().scan(start, end)
    }
}
