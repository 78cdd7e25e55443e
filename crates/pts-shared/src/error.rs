//! # PTS Error Types
//!
//! One workspace-wide error enum with string payloads. Engines map external
//! failures into these variants at the boundary where they occur; the mail
//! front-ends swallow per-message variants and only let configuration and
//! startup storage failures reach the process exit code.

use thiserror::Error;

/// Errors produced by the Package Tracking System core.
#[derive(Debug, Error)]
pub enum PtsError {
    /// Malformed mail, bad VERP address, bad bounce date. Logged, message dropped.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unknown package or team. Warn in control context, drop in dispatch context.
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// Non-public team, unapproved default keyword, loop detected.
    #[error("Policy rejection: {0}")]
    Policy(String),

    /// Storage layer failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// SMTP or HTTP failure. Retried by the transport, not the engine.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A task failed during job execution. The job continues.
    #[error("Task error: {0}")]
    Task(String),

    /// Missing or invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Convenience result alias used throughout the workspace.
pub type PtsResult<T> = Result<T, PtsError>;

impl PtsError {
    /// Whether this error should be swallowed by the mail front-ends
    /// (the MTA must see a zero exit for per-message faults).
    pub fn is_per_message(&self) -> bool {
        !matches!(self, PtsError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_payload() {
        let err = PtsError::Parse("bad header".to_string());
        assert_eq!(err.to_string(), "Parse error: bad header");
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(!PtsError::Configuration("missing fqdn".into()).is_per_message());
        assert!(PtsError::Parse("oops".into()).is_per_message());
        assert!(PtsError::Transport("smtp down".into()).is_per_message());
    }
}
