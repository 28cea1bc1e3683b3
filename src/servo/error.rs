use super::packet::PacketError;

/// Exceptional failures on the servo bus.
///
/// A device that stays silent or answers with a corrupt frame is not an
/// error; instruction calls report that through [`Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("Cannot open serial port {port}: {source}")]
    Connection {
        port: String,
        source: serialport::Error,
    },

    #[error("Bus is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot encode packet: {0}")]
    Packet(#[from] PacketError),
}

pub type Result<T> = std::result::Result<T, ServoError>;

/// Result of one request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// A valid reply arrived
    Value(T),
    /// No valid frame for the addressed device before the deadline
    TimedOut,
    /// A frame for the addressed device arrived but failed its checksum
    ChecksumMismatch,
    /// A valid frame carried the wrong number of parameters
    Malformed,
}

impl<T> Outcome<T> {
    /// Sentinel view: `Some` only for a trustworthy answer
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::ChecksumMismatch => Outcome::ChecksumMismatch,
            Outcome::Malformed => Outcome::Malformed,
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Outcome::Value(v) => f(v),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::ChecksumMismatch => Outcome::ChecksumMismatch,
            Outcome::Malformed => Outcome::Malformed,
        }
    }
}

impl<T> From<Outcome<T>> for Option<T> {
    fn from(outcome: Outcome<T>) -> Option<T> {
        outcome.value()
    }
}

/// Status error bits reported in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(pub u8);

impl ErrorFlags {
    pub const VOLTAGE: u8 = 1;
    pub const ANGLE: u8 = 2;
    pub const OVERHEAT: u8 = 4;
    pub const OVERCURRENT: u8 = 8;
    pub const OVERLOAD: u8 = 32;

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn voltage(self) -> bool {
        self.0 & Self::VOLTAGE != 0
    }

    pub fn angle(self) -> bool {
        self.0 & Self::ANGLE != 0
    }

    pub fn overheat(self) -> bool {
        self.0 & Self::OVERHEAT != 0
    }

    pub fn overcurrent(self) -> bool {
        self.0 & Self::OVERCURRENT != 0
    }

    pub fn overload(self) -> bool {
        self.0 & Self::OVERLOAD != 0
    }

    /// Names of the raised bits, for diagnostics
    pub fn describe(self) -> Vec<&'static str> {
        [
            (Self::VOLTAGE, "input voltage"),
            (Self::ANGLE, "angle sensor"),
            (Self::OVERHEAT, "overheat"),
            (Self::OVERCURRENT, "overcurrent"),
            (Self::OVERLOAD, "overload"),
        ]
        .into_iter()
        .filter(|&(bit, _)| self.0 & bit != 0)
        .map(|(_, name)| name)
        .collect()
    }
}

impl From<u8> for ErrorFlags {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_sentinel_view() {
        assert_eq!(Outcome::Value(7u8).value(), Some(7));
        assert_eq!(Outcome::<u8>::TimedOut.value(), None);
        assert_eq!(Outcome::<u8>::ChecksumMismatch.value(), None);
        let opt: Option<u16> = Outcome::Value(2048u16).into();
        assert_eq!(opt, Some(2048));
        assert_eq!(Outcome::Value(3u8).map(|v| v as i32 * 2), Outcome::Value(6));
        assert_eq!(Outcome::<u8>::Malformed.map(|v| v + 1), Outcome::Malformed);
    }

    #[test]
    fn test_error_flags() {
        let flags = ErrorFlags::from(0x24);
        assert!(!flags.is_ok());
        assert!(flags.overheat());
        assert!(flags.overload());
        assert!(!flags.voltage());
        assert_eq!(flags.describe(), vec!["overheat", "overload"]);
        assert!(ErrorFlags::default().is_ok());
    }
}
