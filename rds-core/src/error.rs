// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Error types for the capture system
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.
//! Transport failures are kept in their own [`LinkError`] type so that callers can
//! tell a recoverable link hiccup apart from a fatal condition.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Step of the board protocol during which a link failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Reconnect,
    Reset,
    SetKey,
    SetMask,
    SendPlaintext,
    WaitDone,
    ReadCipher,
    ReadTrace,
    WriteCalibration,
    CaptureCalibration,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Connect => "connect",
            Step::Reconnect => "reconnect",
            Step::Reset => "device reset",
            Step::SetKey => "set key",
            Step::SetMask => "set mask",
            Step::SendPlaintext => "send plaintext",
            Step::WaitDone => "wait for completion",
            Step::ReadCipher => "read ciphertext",
            Step::ReadTrace => "read sensor trace",
            Step::WriteCalibration => "write calibration",
            Step::CaptureCalibration => "capture calibration trace",
        };
        f.write_str(name)
    }
}

/// Transport-level failure reported by a [`crate::link::Link`]
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Underlying read/write failed or timed out
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Device echoed a different address byte than the one sent
    #[error("non-matching ack (expected 0x{expected:02x}, got 0x{actual:02x})")]
    AckMismatch { expected: u8, actual: u8 },

    /// Completion byte did not match the expected sentinel
    #[error("unexpected completion byte 0x{actual:02x} (expected 0x{expected:02x})")]
    UnexpectedSentinel { expected: u8, actual: u8 },

    /// Status register never reached the expected pattern
    #[error("status register did not settle after {polls} polls (last 0x{last:08x})")]
    PollTimeout { polls: u32, last: u32 },

    /// Operation is not provided by this transport
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    /// Link is closed
    #[error("link is disconnected")]
    Disconnected,
}

/// Core error type for capture operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Board communication failed
    #[error("Link error during {step}: {source}")]
    Link {
        step: Step,
        #[source]
        source: LinkError,
    },

    /// Thermometer code requested with more ones than the field holds
    #[error("Invalid thermometer count {count} for a {width}-bit field")]
    InvalidCount { count: u32, width: u32 },

    /// Decoder called on a trace with no samples
    #[error("Trace contains no samples")]
    EmptyTrace,

    /// Coarse search walked past the last tap without leaving saturation
    #[error("Coarse search exhausted: sensor still saturated at every idc up to {coarse_width}")]
    CoarseSearchExhausted { coarse_width: u32 },

    /// Hardware ciphertext differs from the reference encryption
    #[error("Soft/hard cipher mismatch on trace {index}: expected {expected}, got {actual}")]
    SoftHardMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    /// A single trace failed more often than the configured ceiling
    #[error("Trace {index} failed {attempts} times, giving up: {source}")]
    RetriesExhausted {
        index: u64,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A stop was requested before the operation finished
    #[error("Stopped on request")]
    Interrupted,

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error on dump files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a link failure with the step it happened in
    pub fn link(step: Step, source: LinkError) -> Self {
        Error::Link { step, source }
    }

    /// Check if error is a transient transport failure worth a reconnect
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Link { source, .. } if !matches!(source, LinkError::Unsupported(_)))
    }

    /// Step of the board protocol that failed, if this is a link error
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Link { step, .. } => Some(*step),
            Error::RetriesExhausted { source, .. } => source.step(),
            _ => None,
        }
    }
}

/// Extension to tag a link result with its protocol step
pub trait StepExt<T> {
    fn during(self, step: Step) -> Result<T>;
}

impl<T> StepExt<T> for std::result::Result<T, LinkError> {
    fn during(self, step: Step) -> Result<T> {
        self.map_err(|e| Error::link(step, e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
