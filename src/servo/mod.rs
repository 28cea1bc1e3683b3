// Feetech STS servo bus driver
//
// Provides:
// - Packet codec (framing, checksum, register table)
// - Response parser that resynchronizes on a noisy stream
// - Serial transport and the session/instruction API on top of it
// - A simulated bus for testing without hardware

mod bus;
mod error;
pub mod packet;
pub mod parser;
pub mod sim;
pub mod transport;

pub use bus::{ServoBus, SharedBus};
pub use error::{ErrorFlags, Outcome, Result, ServoError};
pub use packet::{Instruction, PacketError, Register, Signedness};
pub use transport::{SerialTransport, Transport};
