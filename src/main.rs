use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use servo_bus::config::{SCAN_END, SCAN_START, SessionConfig};
use servo_bus::messages::{PingReport, ReadReport, ScanReport, WriteReport};
use servo_bus::servo::sim::SimulatedBus;
use servo_bus::servo::{Register, ServoBus, Signedness};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Talk to Feetech STS servos on a half-duplex serial bus
#[derive(Parser, Debug)]
#[command(name = "servo-bus", version, about)]
struct Cli {
    /// Serial port device name, e.g. "/dev/ttyUSB0" or "COM3"
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate; must match the servos' configured rate
    #[arg(short, long)]
    baudrate: Option<u32>,

    /// Reply timeout per instruction, in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// JSON session config; flags override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,

    /// Run against simulated servos with these ids instead of a port
    #[arg(long, value_delimiter = ',')]
    simulate: Option<Vec<u8>>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping every id in a range and list the responders
    Scan {
        #[arg(long, default_value_t = SCAN_START)]
        start: u8,
        #[arg(long, default_value_t = SCAN_END)]
        end: u8,
    },
    /// Check whether one servo answers
    Ping { id: u8 },
    /// Read a register (by name or address)
    Read {
        id: u8,
        #[arg(value_parser = parse_register)]
        register: RegisterArg,
        /// Read two bytes at a numeric address
        #[arg(long)]
        word: bool,
        /// Interpret a word as two's complement
        #[arg(long, conflicts_with = "unsigned")]
        signed: bool,
        /// Interpret a word as unsigned even for signed registers
        #[arg(long)]
        unsigned: bool,
    },
    /// Write a register (by name or address)
    #[command(allow_negative_numbers = true)]
    Write {
        id: u8,
        #[arg(value_parser = parse_register)]
        register: RegisterArg,
        /// Negative values are written as two's complement words
        #[arg(value_parser = clap::value_parser!(i32).range(-32768..=65535))]
        value: i32,
        /// Write two bytes at a numeric address
        #[arg(long)]
        word: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct RegisterArg {
    address: u8,
    width: u8,
    signed: bool,
}

fn parse_register(s: &str) -> Result<RegisterArg, String> {
    if let Some(register) = Register::from_name(s) {
        return Ok(RegisterArg {
            address: register.into(),
            width: register.width(),
            signed: register.is_signed(),
        });
    }
    let address = s.parse::<u8>().map_err(|_| {
        let names: Vec<&str> = Register::ALL.iter().map(|r| r.name()).collect();
        format!("expected an address 0-255 or one of: {}", names.join(", "))
    })?;
    Ok(RegisterArg {
        address,
        width: 1,
        signed: false,
    })
}

fn session_config(cli: &Cli) -> CliResult<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(baudrate) = cli.baudrate {
        config.baudrate = baudrate;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout = Duration::from_millis(timeout_ms);
    }
    Ok(config)
}

fn emit<T: Serialize>(json: bool, report: &T, text: impl FnOnce() -> String) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

/// Runs the command; `Ok(false)` means the device gave no usable answer
fn run(cli: Cli) -> CliResult<bool> {
    let config = session_config(&cli)?;
    let mut bus = match &cli.simulate {
        Some(ids) => ServoBus::with_transport(config, SimulatedBus::with_devices(ids)),
        None => ServoBus::open(config)?,
    };

    let success = match cli.command {
        Command::Scan { start, end } => {
            let found = bus.scan(start, end)?;
            let report = ScanReport {
                port: bus.config().port.clone(),
                start,
                end,
                found,
            };
            emit(cli.json, &report, || {
                if report.found.is_empty() {
                    "No servos found on the bus.".to_string()
                } else {
                    format!("Found ids: {:?}", report.found)
                }
            })?;
            true
        }
        Command::Ping { id } => {
            let report = PingReport {
                id,
                responding: bus.ping(id)?,
            };
            emit(cli.json, &report, || {
                if report.responding {
                    format!("Servo {} responding", id)
                } else {
                    format!("Servo {}: no response", id)
                }
            })?;
            report.responding
        }
        Command::Read {
            id,
            register,
            word,
            signed,
            unsigned,
        } => {
            let word = word || register.width == 2;
            if (signed || unsigned) && !word {
                return Err("--signed/--unsigned only apply to word reads; add --word".into());
            }
            let outcome = if word {
                let signedness = if signed || (register.signed && !unsigned) {
                    Signedness::Signed
                } else {
                    Signedness::Unsigned
                };
                bus.read_word(id, register.address, signedness)?
            } else {
                bus.read_byte(id, register.address)?.map(i32::from)
            };
            let report = ReadReport::new(id, register.address, outcome);
            emit(cli.json, &report, || match report.value {
                Some(value) => format!("Servo {} reg {} = {}", id, register.address, value),
                None => format!("Servo {} reg {}: {}", id, register.address, report.status),
            })?;
            report.value.is_some()
        }
        Command::Write {
            id,
            register,
            value,
            word,
        } => {
            let outcome = if word || register.width == 2 {
                let signedness = if value < 0 {
                    Signedness::Signed
                } else {
                    Signedness::Unsigned
                };
                bus.write_word_value(id, register.address, value, signedness)?
            } else {
                let byte = u8::try_from(value)
                    .map_err(|_| format!("value {} does not fit a 1-byte register", value))?;
                bus.write_byte(id, register.address, byte)?
            };
            let report = WriteReport::new(id, register.address, value, outcome);
            emit(cli.json, &report, || match report.error_flags {
                Some(0) => format!("Servo {} reg {} <- {}", id, register.address, value),
                Some(raw) => format!(
                    "Servo {} reg {} <- {}: status 0x{:02X} ({})",
                    id,
                    register.address,
                    value,
                    raw,
                    report.errors.join(", ")
                ),
                None => format!("Servo {} reg {}: {}", id, register.address, report.status),
            })?;
            report.succeeded()
        }
    };

    bus.disconnect();
    Ok(success)
}

fn main() {
    let cli = Cli::parse();

    // Setup logging on stderr (RUST_LOG overrides, -v raises the level)
    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_register_by_name_and_number() {
        let named = parse_register("present-position").unwrap();
        assert_eq!(named.address, 56);
        assert_eq!(named.width, 2);
        assert!(named.signed);

        let raw = parse_register("40").unwrap();
        assert_eq!(raw.address, 40);
        assert_eq!(raw.width, 1);

        assert!(parse_register("300").is_err());
        assert!(parse_register("speed").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "servo-bus",
            "--port",
            "/dev/gimbal",
            "-t",
            "250",
            "ping",
            "11",
        ]);
        let config = session_config(&cli).unwrap();
        assert_eq!(config.port, "/dev/gimbal");
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.baudrate, 1_000_000);
    }

    #[test]
    fn test_simulated_write_then_read() {
        let write = Cli::parse_from([
            "servo-bus",
            "--simulate",
            "11",
            "-t",
            "20",
            "write",
            "11",
            "goal-position",
            "2048",
        ]);
        assert!(run(write).unwrap());

        let read = Cli::parse_from([
            "servo-bus",
            "--simulate",
            "11",
            "-t",
            "20",
            "read",
            "11",
            "id",
        ]);
        assert!(run(read).unwrap());

        let missing = Cli::parse_from(["servo-bus", "--simulate", "11", "-t", "5", "ping", "12"]);
        assert!(!run(missing).unwrap());
    }

    #[test]
    fn test_byte_register_rejects_large_value() {
        let cli = Cli::parse_from(["servo-bus", "--simulate", "1", "write", "1", "id", "300"]);
        assert!(run(cli).is_err());

        let cli = Cli::parse_from(["servo-bus", "--simulate", "1", "write", "1", "id", "-1"]);
        assert!(run(cli).is_err());
    }

    #[test]
    fn test_write_accepts_negative_word() {
        let cli = Cli::try_parse_from([
            "servo-bus",
            "--simulate",
            "1",
            "-t",
            "20",
            "write",
            "1",
            "homing-offset",
            "-100",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Write { value: -100, .. }));
        assert!(run(cli).unwrap());

        let too_low = Cli::try_parse_from(["servo-bus", "write", "1", "homing-offset", "-40000"]);
        assert!(too_low.is_err());
        let too_high = Cli::try_parse_from(["servo-bus", "write", "1", "goal-position", "65536"]);
        assert!(too_high.is_err());
    }

    #[test]
    fn test_signedness_flags_require_word_read() {
        let byte = Cli::parse_from([
            "servo-bus",
            "--simulate",
            "1",
            "read",
            "1",
            "40",
            "--signed",
        ]);
        assert!(run(byte).is_err());

        let word = Cli::parse_from([
            "servo-bus",
            "--simulate",
            "1",
            "-t",
            "20",
            "read",
            "1",
            "40",
            "--word",
            "--signed",
        ]);
        assert!(run(word).unwrap());
    }
}
