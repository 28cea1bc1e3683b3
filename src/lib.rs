pub mod config;
pub mod messages;
pub mod servo;

pub use config::SessionConfig;
pub use servo::{Outcome, Register, ServoBus, ServoError, SharedBus};
