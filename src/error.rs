//! Error types for the stage driver.
//!
//! `StageError` is the single error type returned by every externally visible
//! operation in this crate. Using the `thiserror` crate, it separates the
//! protocol-level failures (bad input, garbled responses, silent device) from
//! the transport and configuration failures that surround them.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidVelocity`** / **`InvalidDistance`**: Rejected locally before any
//!   byte reaches the controller. Not retryable without correcting the input.
//! - **`MalformedResponse`**: A position line did not match the fixed
//!   `<axis><sign><7 digits>` layout. Surfaced to the caller, never retried
//!   automatically, since a corrupt frame may mean the link is out of step.
//! - **`Timeout`**: No response line arrived within the channel read timeout.
//!   Only the readiness-poll loop retries this on its own.
//! - **`NotReady`**: A bounded readiness wait ran out of attempts or time.
//! - **`ChannelClosed`**: The stage was disposed (or the port hit EOF). Fatal
//!   for that controller instance.
//! - **`Io`**, **`Configuration`**, **`Config`**: Transport and setup failures.

use crate::protocol::ReadinessStatus;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the stage error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Primary error type for stage communication.
#[derive(Error, Debug)]
pub enum StageError {
    /// Requested velocity lies outside (0, 6000] steps/second.
    #[error("Invalid velocity {0} steps/s: must be in 1..=6000")]
    InvalidVelocity(i64),

    /// Requested move distance is not a finite number.
    #[error("Invalid move distance {0}: must be finite")]
    InvalidDistance(f64),

    /// A response line could not be decoded.
    #[error("Malformed response {response:?}: {reason}")]
    MalformedResponse {
        /// The offending line, terminator stripped.
        response: String,
        /// What about the line was wrong.
        reason: &'static str,
    },

    /// No response line within the channel read timeout.
    #[error("No response from controller within {0:?}")]
    Timeout(Duration),

    /// Operation attempted after the channel was released.
    #[error("Channel to the controller is closed")]
    ChannelClosed,

    /// A bounded readiness wait gave up before the controller reported ready.
    #[error("Controller not ready after {attempts} polls (last status: {last:?})")]
    NotReady {
        /// Number of readiness queries sent.
        attempts: u32,
        /// Last decoded status, if any response arrived at all.
        last: Option<ReadinessStatus>,
    },

    /// Underlying serial I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl StageError {
    pub(crate) fn malformed(response: &str, reason: &'static str) -> Self {
        StageError::MalformedResponse {
            response: response.to_string(),
            reason,
        }
    }

    /// Whether the same controller instance can keep being used after this error.
    ///
    /// Input errors, garbled frames and timeouts leave the link usable; a closed
    /// channel, an I/O failure or a broken configuration do not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StageError::InvalidVelocity(_)
            | StageError::InvalidDistance(_)
            | StageError::MalformedResponse { .. }
            | StageError::Timeout(_)
            | StageError::NotReady { .. } => true,
            StageError::ChannelClosed
            | StageError::Io(_)
            | StageError::Configuration(_)
            | StageError::Config(_) => false,
        }
    }
}

impl From<figment::Error> for StageError {
    fn from(value: figment::Error) -> Self {
        StageError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recoverable_errors() {
        assert!(StageError::Timeout(Duration::from_millis(100)).is_recoverable());
        assert!(StageError::malformed("X+12", "too short").is_recoverable());
        assert!(StageError::NotReady {
            attempts: 3,
            last: Some(ReadinessStatus::Busy)
        }
        .is_recoverable());
        assert!(!StageError::ChannelClosed.is_recoverable());
        assert!(!StageError::Io(std::io::ErrorKind::BrokenPipe.into()).is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = StageError::InvalidVelocity(7000);
        assert!(err.to_string().contains("7000"));

        let err = StageError::malformed("Z00123", "shorter than 9 characters");
        let msg = err.to_string();
        assert!(msg.contains("Z00123"));
        assert!(msg.contains("shorter than 9 characters"));
    }
}
