// Response parser: byte-at-a-time state machine over a live serial stream
//
// SeekHeader -> HaveHeader -> HaveId -> ReadBody -> (Complete | ChecksumMismatch)
//
// Noise, truncated frames and replies from other ids are skipped by falling
// back to SeekHeader. The parser never waits; the caller feeds it whatever
// the transport returned and decides when the deadline has passed.

use tracing::{trace, warn};

use super::packet::checksum;

/// Parser position in the frame grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Looking for 0xFF 0xFF. `seen_ff` is true after the first one.
    SeekHeader { seen_ff: bool },
    /// Header seen, waiting for the id byte
    HaveHeader,
    /// Id matched, waiting for the length byte
    HaveId { id: u8 },
    /// Collecting `length` body bytes (error flags, params, checksum)
    ReadBody { id: u8, length: u8 },
}

/// A validated response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub error: u8,
    pub params: Vec<u8>,
}

/// Result of feeding one byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Need more bytes
    Pending,
    /// A frame for the expected id passed validation
    Complete(StatusPacket),
    /// A frame for the expected id failed validation; parser is seeking again
    ChecksumMismatch,
}

/// Why a read window closed without a valid frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Deadline hit while a frame body was only partly received
    Incomplete,
    /// Deadline hit with no frame in progress
    TimedOut,
}

#[derive(Debug)]
pub struct ResponseParser {
    expected_id: u8,
    state: ParseState,
    body: Vec<u8>,
    mismatches: usize,
}

impl ResponseParser {
    pub fn new(expected_id: u8) -> Self {
        Self {
            expected_id,
            state: ParseState::SeekHeader { seen_ff: false },
            body: Vec::new(),
            mismatches: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Number of frames for the expected id rejected so far
    pub fn mismatches(&self) -> usize {
        self.mismatches
    }

    /// Feed a chunk of bytes, stopping at the first complete frame.
    ///
    /// Bytes after a complete frame are left unconsumed; the returned count
    /// says how many were used.
    pub fn feed(&mut self, bytes: &[u8]) -> (usize, Step) {
        let mut result = Step::Pending;
        for (i, &byte) in bytes.iter().enumerate() {
            match self.push(byte) {
                Step::Pending => {}
                Step::ChecksumMismatch => result = Step::ChecksumMismatch,
                done @ Step::Complete(_) => return (i + 1, done),
            }
        }
        (bytes.len(), result)
    }

    /// Advance the state machine by one byte
    pub fn push(&mut self, byte: u8) -> Step {
        match self.state {
            ParseState::SeekHeader { seen_ff } => {
                self.state = match (seen_ff, byte) {
                    (true, 0xFF) => ParseState::HaveHeader,
                    (false, 0xFF) => ParseState::SeekHeader { seen_ff: true },
                    _ => ParseState::SeekHeader { seen_ff: false },
                };
                Step::Pending
            }
            ParseState::HaveHeader => {
                // A third 0xFF is still header; 0xFF is never a device id.
                if byte == 0xFF {
                    return Step::Pending;
                }
                if byte != self.expected_id {
                    trace!(
                        "Skipping frame from id {} (expected {})",
                        byte, self.expected_id
                    );
                    self.reset();
                    return Step::Pending;
                }
                self.state = ParseState::HaveId { id: byte };
                Step::Pending
            }
            ParseState::HaveId { id } => {
                // Body must hold at least error flags and checksum
                if byte < 2 {
                    trace!("Discarding frame with impossible length {}", byte);
                    self.reset();
                    return Step::Pending;
                }
                self.state = ParseState::ReadBody { id, length: byte };
                Step::Pending
            }
            ParseState::ReadBody { id, length } => {
                self.body.push(byte);
                if self.body.len() < length as usize {
                    return Step::Pending;
                }
                let step = self.validate(id, length);
                self.reset();
                step
            }
        }
    }

    /// Close the read window
    pub fn finish(&self) -> Termination {
        match self.state {
            ParseState::ReadBody { .. } => Termination::Incomplete,
            _ => Termination::TimedOut,
        }
    }

    fn validate(&mut self, id: u8, length: u8) -> Step {
        let (payload, received) = self.body.split_at(self.body.len() - 1);
        let mut summed = Vec::with_capacity(self.body.len() + 1);
        summed.push(id);
        summed.push(length);
        summed.extend_from_slice(payload);
        let expected = checksum(&summed);

        if expected != received[0] {
            warn!(
                "Checksum mismatch for motor {}: expected 0x{:02X}, got 0x{:02X}",
                id, expected, received[0]
            );
            self.mismatches += 1;
            return Step::ChecksumMismatch;
        }

        Step::Complete(StatusPacket {
            id,
            error: payload[0],
            params: payload[1..].to_vec(),
        })
    }

    fn reset(&mut self) {
        self.state = ParseState::SeekHeader { seen_ff: false };
        self.body.clear();
    }
}
