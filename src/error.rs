//! error.rs
//! Error kinds shared by the device and host sides.
//!
//! None of these terminate the managing process: transport failures are retried,
//! malformed records and overflows are counted and dropped, out-of-range values
//! are clamped, invalid starts are rejected.

use std::io;
use thiserror::Error;

use crate::device::params::ExperimentMode;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Socket or broker connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Telemetry record that does not match any known shape.
    #[error("malformed telemetry record ({reason}): {record:?}")]
    Protocol { record: String, reason: String },

    /// Parameter outside its allowed range (the stored value is clamped).
    #[error("{key} = {requested} out of range, clamped to {clamped}")]
    Validation {
        key: String,
        requested: f64,
        clamped: f64,
    },

    /// Start requested while the stored parameters are unusable.
    #[error("cannot start {mode:?}: {reason}")]
    State { mode: ExperimentMode, reason: String },

    /// Deadband ramp passed the safety ceiling without detecting motion.
    #[error("deadband calibration timed out at drive {drive}, reverted to {fallback}")]
    CalibrationTimeout { drive: u16, fallback: f64 },

    /// Router queue full; the incoming sample was dropped.
    #[error("router queue full ({dropped} dropped so far)")]
    Overflow { dropped: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// Test-only equality so tests can compare results carrying an optional error.
// `io::Error` is not `PartialEq`, so compare variant and rendered message.
#[cfg(test)]
impl PartialEq for PlatformError {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}

impl PlatformError {
    pub fn transport(msg: impl Into<String>) -> Self {
        PlatformError::Transport(msg.into())
    }

    pub fn protocol(record: &str, reason: impl Into<String>) -> Self {
        PlatformError::Protocol {
            record: record.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;
