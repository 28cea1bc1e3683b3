// Feetech STS serial packet codec
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Request:  [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Response: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]
// Length = params + 2, checksum = !(ID + Length + ... + last param)

/// Packet header bytes
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Highest addressable device id
pub const MAX_ID: u8 = 253;

/// Broadcast id: every device executes, none replies
pub const BROADCAST_ID: u8 = 0xFE;

/// Largest parameter count that still fits the length byte
pub const MAX_PARAMS: usize = u8::MAX as usize - 2;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

impl TryFrom<u8> for Instruction {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        Ok(match code {
            0x01 => Self::Ping,
            0x02 => Self::Read,
            0x03 => Self::Write,
            0x04 => Self::RegWrite,
            0x05 => Self::Action,
            0x82 => Self::SyncRead,
            0x83 => Self::SyncWrite,
            other => return Err(other),
        })
    }
}

/// Register addresses for STS series servos
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM area (persists across power cycles unless locked)
    ModelNumber = 3,       // 2 bytes, read-only
    Id = 5,                // 1 byte
    BaudRate = 6,          // 1 byte
    MinPositionLimit = 9,  // 2 bytes
    MaxPositionLimit = 11, // 2 bytes
    HomingOffset = 31,     // 2 bytes, signed

    // RAM area (volatile)
    TorqueEnable = 40,    // 1 byte: 0=off, 1=on
    GoalPosition = 42,    // 2 bytes
    Lock = 55,            // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56, // 2 bytes, signed, read-only
}

impl Register {
    pub const ALL: [Register; 10] = [
        Register::ModelNumber,
        Register::Id,
        Register::BaudRate,
        Register::MinPositionLimit,
        Register::MaxPositionLimit,
        Register::HomingOffset,
        Register::TorqueEnable,
        Register::GoalPosition,
        Register::Lock,
        Register::PresentPosition,
    ];

    /// Width of the register in bytes
    pub fn width(self) -> u8 {
        match self {
            Register::Id | Register::BaudRate | Register::TorqueEnable | Register::Lock => 1,
            _ => 2,
        }
    }

    /// Registers whose raw word is conventionally read as two's-complement
    pub fn is_signed(self) -> bool {
        matches!(self, Register::HomingOffset | Register::PresentPosition)
    }

    /// Kebab-case name, as accepted on the command line
    pub fn name(self) -> &'static str {
        match self {
            Register::ModelNumber => "model-number",
            Register::Id => "id",
            Register::BaudRate => "baud-rate",
            Register::MinPositionLimit => "min-position-limit",
            Register::MaxPositionLimit => "max-position-limit",
            Register::HomingOffset => "homing-offset",
            Register::TorqueEnable => "torque-enable",
            Register::GoalPosition => "goal-position",
            Register::Lock => "lock",
            Register::PresentPosition => "present-position",
        }
    }

    pub fn from_name(name: &str) -> Option<Register> {
        Register::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl From<Register> for u8 {
    fn from(register: Register) -> u8 {
        register as u8
    }
}

/// How a two-byte register value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Unsigned,
    Signed,
}

/// Errors raised while building or taking apart a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Too many parameters for one packet: {count} (max 253)")]
    TooManyParameters { count: usize },

    #[error("Invalid device id 0x{id:02X}")]
    InvalidId { id: u8 },

    #[error("Frame too short: {len} bytes")]
    TooShort { len: usize },

    #[error("Invalid header: {0:02X?}")]
    BadHeader([u8; 2]),

    #[error("Length byte says {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{received:02X}")]
    ChecksumMismatch { expected: u8, received: u8 },

    #[error("Value {value} does not fit a {signedness:?} register word")]
    WordOutOfRange { value: i32, signedness: Signedness },
}

/// A decoded frame. `code` is the instruction for requests and the error
/// flags for responses; the wire layout is identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub length: u8,
    pub code: u8,
    pub params: Vec<u8>,
    pub checksum: u8,
}

/// Calculate checksum for a packet (excluding header)
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    !sum
}

/// Build a request packet with header and checksum
pub fn encode(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>, PacketError> {
    encode_raw(id, instruction as u8, params)
}

/// Build a frame around an arbitrary code byte. Devices (and the simulator)
/// use this with an error-flags byte to produce responses.
pub fn encode_raw(id: u8, code: u8, params: &[u8]) -> Result<Vec<u8>, PacketError> {
    if id == 0xFF {
        return Err(PacketError::InvalidId { id });
    }
    if params.len() > MAX_PARAMS {
        return Err(PacketError::TooManyParameters {
            count: params.len(),
        });
    }

    let length = (params.len() + 2) as u8; // params + code + checksum
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(code);
    packet.extend_from_slice(params);

    // Checksum over id, length, code, params
    let sum = checksum(&packet[2..]);
    packet.push(sum);

    Ok(packet)
}

/// Decode one complete, already delimited frame.
pub fn decode(frame: &[u8]) -> Result<Frame, PacketError> {
    if frame.len() < 6 {
        return Err(PacketError::TooShort { len: frame.len() });
    }
    let header = [frame[0], frame[1]];
    if header != HEADER {
        return Err(PacketError::BadHeader(header));
    }

    let id = frame[2];
    let length = frame[3];
    let body = &frame[4..];
    if body.len() != length as usize {
        return Err(PacketError::LengthMismatch {
            declared: length as usize,
            actual: body.len(),
        });
    }

    let (payload, received) = body.split_at(body.len() - 1);
    let received = received[0];
    let expected = checksum(&frame[2..frame.len() - 1]);
    if expected != received {
        return Err(PacketError::ChecksumMismatch { expected, received });
    }

    Ok(Frame {
        id,
        length,
        code: payload[0],
        params: payload[1..].to_vec(),
        checksum: received,
    })
}

/// Decode a little-endian register word.
///
/// With [`Signedness::Signed`] raw values of 32768 and above are negative
/// (two's complement).
pub fn decode_word(bytes: [u8; 2], signedness: Signedness) -> i32 {
    let raw = u16::from_le_bytes(bytes);
    match signedness {
        Signedness::Unsigned => raw as i32,
        Signedness::Signed => raw as i16 as i32,
    }
}

/// Split a register word into its little-endian bytes
pub fn encode_word(value: u16) -> [u8; 2] {
    [(value & 0xFF) as u8, (value >> 8) as u8]
}

/// Encode a register word from its signed or unsigned interpretation.
///
/// Signed values use two's complement, so -1 goes on the wire as 0xFFFF.
pub fn encode_word_value(value: i32, signedness: Signedness) -> Result<[u8; 2], PacketError> {
    let raw = match signedness {
        Signedness::Unsigned => u16::try_from(value).ok(),
        Signedness::Signed => i16::try_from(value).ok().map(|v| v as u16),
    };
    raw.map(encode_word)
        .ok_or(PacketError::WordOutOfRange { value, signedness })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // Example: ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&data), 215);
    }

    #[test]
    fn test_checksum_wraps_mod_256() {
        // 0xFE + 0x04 + 0xFF = 0x201 -> 0x01 -> !0x01 = 0xFE
        assert_eq!(checksum(&[0xFE, 0x04, 0xFF]), 0xFE);
        assert_eq!(checksum(&[]), 0xFF);
    }

    #[test]
    fn test_build_packet() {
        let packet = encode(1, Instruction::Ping, &[]).unwrap();
        // Header (2) + ID (1) + Length (1) + Instruction (1) + Checksum (1) = 6 bytes
        assert_eq!(packet, vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn test_build_write_word_packet() {
        let [lo, hi] = encode_word(2048);
        let packet =
            encode(11, Instruction::Write, &[Register::GoalPosition.into(), lo, hi]).unwrap();
        assert_eq!(packet[..7], [0xFF, 0xFF, 11, 5, 0x03, 42, 0x00]);
        assert_eq!(packet[7], 0x08);
        assert_eq!(packet[8], checksum(&packet[2..8]));
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        assert_eq!(
            encode(0xFF, Instruction::Ping, &[]),
            Err(PacketError::InvalidId { id: 0xFF })
        );
        let params = vec![0u8; MAX_PARAMS + 1];
        assert_eq!(
            encode(1, Instruction::Write, &params),
            Err(PacketError::TooManyParameters {
                count: MAX_PARAMS + 1
            })
        );
        assert!(encode(1, Instruction::Write, &params[..MAX_PARAMS]).is_ok());
    }

    #[test]
    fn test_decode_recovers_encoded_fields() {
        let cases: [(u8, Instruction, &[u8]); 4] = [
            (0, Instruction::Ping, &[]),
            (7, Instruction::Read, &[56, 2]),
            (MAX_ID, Instruction::Write, &[42, 0x00, 0x08]),
            (BROADCAST_ID, Instruction::Action, &[]),
        ];
        for (id, instruction, params) in cases {
            let bytes = encode(id, instruction, params).unwrap();
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.id, id);
            assert_eq!(frame.length as usize, params.len() + 2);
            assert_eq!(Instruction::try_from(frame.code), Ok(instruction));
            assert_eq!(frame.params, params);
            assert_eq!(frame.checksum, checksum(&bytes[2..bytes.len() - 1]));
        }
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let bytes = encode(3, Instruction::Write, &[40, 1]).unwrap();
        for i in 2..bytes.len() - 1 {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x10;
            let err = decode(&corrupted).unwrap_err();
            // Flipping the length byte trips the length check first
            if i == 3 {
                assert!(matches!(err, PacketError::LengthMismatch { .. }));
            } else {
                assert!(
                    matches!(err, PacketError::ChecksumMismatch { .. }),
                    "byte {i}"
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(
            decode(&[0xFF, 0xFF, 1]),
            Err(PacketError::TooShort { len: 3 })
        );
        assert_eq!(
            decode(&[0xFF, 0x00, 1, 2, 0, 0xFC]),
            Err(PacketError::BadHeader([0xFF, 0x00]))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 1, 3, 0, 0xFB]),
            Err(PacketError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_word_signedness_boundary() {
        assert_eq!(decode_word(encode_word(32767), Signedness::Signed), 32767);
        assert_eq!(decode_word(encode_word(32768), Signedness::Signed), -32768);
        assert_eq!(decode_word(encode_word(65535), Signedness::Signed), -1);
        assert_eq!(decode_word(encode_word(32767), Signedness::Unsigned), 32767);
        assert_eq!(decode_word(encode_word(32768), Signedness::Unsigned), 32768);
        assert_eq!(decode_word(encode_word(65535), Signedness::Unsigned), 65535);
    }

    #[test]
    fn test_signed_word_encodes_twos_complement() {
        let signed = Signedness::Signed;
        let unsigned = Signedness::Unsigned;
        assert_eq!(encode_word_value(-100, signed), Ok(encode_word(65436)));
        assert_eq!(encode_word_value(-1, signed), Ok([0xFF, 0xFF]));
        assert_eq!(encode_word_value(-32768, signed), Ok([0x00, 0x80]));
        assert_eq!(encode_word_value(65535, unsigned), Ok([0xFF, 0xFF]));
        assert_eq!(
            decode_word(encode_word_value(-100, signed).unwrap(), signed),
            -100
        );
        assert_eq!(
            encode_word_value(32768, signed),
            Err(PacketError::WordOutOfRange {
                value: 32768,
                signedness: signed
            })
        );
        assert!(encode_word_value(-1, unsigned).is_err());
        assert!(encode_word_value(65536, unsigned).is_err());
    }

    #[test]
    fn test_register_table() {
        assert_eq!(u8::from(Register::PresentPosition), 56);
        assert_eq!(Register::Lock.width(), 1);
        assert_eq!(Register::HomingOffset.width(), 2);
        assert!(Register::PresentPosition.is_signed());
        assert!(!Register::GoalPosition.is_signed());
        for register in Register::ALL {
            assert_eq!(Register::from_name(register.name()), Some(register));
        }
        assert_eq!(Register::from_name("bogus"), None);
    }
}
