// Report types printed by the command-line tool (text or JSON)

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::servo::{ErrorFlags, Outcome};

/// How an instruction ended, as seen by a caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    TimedOut,
    ChecksumMismatch,
    Malformed,
}

impl<T> From<&Outcome<T>> for ReplyStatus {
    fn from(outcome: &Outcome<T>) -> Self {
        match outcome {
            Outcome::Value(_) => ReplyStatus::Ok,
            Outcome::TimedOut => ReplyStatus::TimedOut,
            Outcome::ChecksumMismatch => ReplyStatus::ChecksumMismatch,
            Outcome::Malformed => ReplyStatus::Malformed,
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::TimedOut => "no response",
            ReplyStatus::ChecksumMismatch => "checksum mismatch",
            ReplyStatus::Malformed => "malformed response",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanReport {
    pub port: String,
    pub start: u8,
    pub end: u8,
    pub found: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingReport {
    pub id: u8,
    pub responding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReport {
    pub id: u8,
    pub register: u8,
    pub status: ReplyStatus,
    pub value: Option<i32>,
}

impl ReadReport {
    pub fn new(id: u8, register: u8, outcome: Outcome<i32>) -> Self {
        Self {
            id,
            register,
            status: ReplyStatus::from(&outcome),
            value: outcome.value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteReport {
    pub id: u8,
    pub register: u8,
    pub value: i32,
    pub status: ReplyStatus,
    /// Device status byte, when it answered
    pub error_flags: Option<u8>,
    /// Names of the raised status bits
    pub errors: Vec<String>,
}

impl WriteReport {
    pub fn new(id: u8, register: u8, value: i32, outcome: Outcome<u8>) -> Self {
        let flags = outcome.value();
        Self {
            id,
            register,
            value,
            status: ReplyStatus::from(&outcome),
            error_flags: flags,
            errors: flags
                .map(|raw| {
                    ErrorFlags::from(raw)
                        .describe()
                        .into_iter()
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Device answered and raised no status bits
    pub fn succeeded(&self) -> bool {
        self.error_flags == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_report_serializes_status() {
        let report = ReadReport::new(3, 56, Outcome::TimedOut);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert!(json["value"].is_null());

        let report = ReadReport::new(3, 56, Outcome::Value(-12));
        assert_eq!(report.status, ReplyStatus::Ok);
        assert_eq!(report.value, Some(-12));
    }

    #[test]
    fn test_write_report_names_error_bits() {
        let report = WriteReport::new(1, 42, 2048, Outcome::Value(ErrorFlags::OVERLOAD));
        assert!(!report.succeeded());
        assert_eq!(report.errors, vec!["overload".to_string()]);

        let report = WriteReport::new(1, 42, 2048, Outcome::ChecksumMismatch);
        assert_eq!(report.status, ReplyStatus::ChecksumMismatch);
        assert!(!report.succeeded());
        assert!(report.errors.is_empty());
    }
}
