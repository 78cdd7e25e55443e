//! The email control interface: command grammar and the mail processor.

pub mod commands;
pub mod processor;

pub use commands::{CommandFactory, ParsedCommand};
pub use processor::{ControlOutcome, ControlProcessor, MAX_ALLOWED_ERRORS};
