// Servo diagnostic: READ-ONLY sweep of a servo bus
//
// This tool does NOT write anything to the servos - it's completely safe.
// Scans the bus, then dumps the calibration-relevant registers of every
// servo that answered.
//
// Usage: cargo run --example servo_diagnostic -- [port] [start_id] [end_id]
// Example: cargo run --example servo_diagnostic -- /dev/ttyACM1 0 20

use servo_bus::config::{SCAN_END, SCAN_START, SessionConfig};
use servo_bus::servo::{Outcome, Register, ServoBus};
use std::time::Duration;

fn show<T: std::fmt::Display>(label: &str, outcome: Outcome<T>) {
    match outcome {
        Outcome::Value(v) => println!("    {:<20} {}", label, v),
        Outcome::TimedOut => println!("    {:<20} NO RESPONSE", label),
        Outcome::ChecksumMismatch => println!("    {:<20} CHECKSUM ERROR", label),
        Outcome::Malformed => println!("    {:<20} MALFORMED REPLY", label),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(servo_bus::config::default_port);
    let start: u8 = args
        .next()
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(SCAN_START);
    let end: u8 = args
        .next()
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(SCAN_END);

    println!("Servo bus diagnostic (READ-ONLY)");
    println!("Serial port: {}", port);
    println!();

    // Scanning all 254 ids at 100ms each is slow; 30ms is plenty at 1 Mbaud
    let config = SessionConfig::new(port).with_timeout(Duration::from_millis(30));

    println!("Step 1: Opening serial port...");
    let mut bus = match ServoBus::open(config) {
        Ok(bus) => {
            println!("  ✓ Serial port opened successfully");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the USB cable is connected");
            println!("  - On Linux, check you are in the dialout group");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Scanning ids {}..={}...", start, end);
    let found = bus.scan(start, end)?;
    if found.is_empty() {
        println!("  ✗ No servos responded");
        println!("  - Check servo power supply and wiring");
        println!("  - Check the baud rate matches the servos");
        return Ok(());
    }
    println!("  ✓ Found: {:?}", found);
    println!();

    println!("Step 3: Reading servo registers...");
    bus.set_timeout(Duration::from_millis(100));
    for id in found {
        println!("  === Servo {} ===", id);
        show("Model:", bus.read_word_unsigned(id, Register::ModelNumber)?);
        show("Torque enable:", bus.read_byte(id, Register::TorqueEnable)?);
        show("EPROM lock:", bus.read_byte(id, Register::Lock)?);
        show(
            "Min limit:",
            bus.read_word_unsigned(id, Register::MinPositionLimit)?,
        );
        show(
            "Max limit:",
            bus.read_word_unsigned(id, Register::MaxPositionLimit)?,
        );
        show(
            "Homing offset:",
            bus.read_word_signed(id, Register::HomingOffset)?,
        );

        match bus.read_word_signed(id, Register::PresentPosition)? {
            Outcome::Value(pos) => {
                let degrees = (pos as f32) * 360.0 / 4096.0;
                println!("    {:<20} {} ({:.1}°)", "Present position:", pos, degrees);
            }
            other => show("Present position:", other),
        }

        match bus.status(id)? {
            Outcome::Value(flags) if flags.is_ok() => println!("    {:<20} ok", "Status:"),
            Outcome::Value(flags) => {
                println!("    {:<20} {}", "Status:", flags.describe().join(", "))
            }
            other => show("Status:", other.map(|flags| flags.0)),
        }
        println!();
    }

    bus.disconnect();
    println!("Diagnostic complete.");
    Ok(())
}
