//! Custom error types for the acquisition run.
//!
//! This module defines the primary error type, `CaptureError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent place for every failure that
//! can surface to the control loop, from a silent motion controller to a sensor that
//! stopped delivering frames.
//!
//! ## Error Hierarchy
//!
//! - **Handshake**: `HandshakeTimeout`, `TriggerTimeout`, `LinkTimeout`, and the serial
//!   port variants. These come from the controller link and are fatal for a run.
//! - **Sensor**: a single failed grab is a `GrabError`, not a `CaptureError`; the control
//!   loop retries it against the same trigger and converts it to `GrabRetriesExhausted`
//!   once the retry bound is spent. `Sensor` covers open/configure/stream failures.
//! - **Persistence**: `Io`, `Csv` and `Json` for the report and metadata files. Image
//!   write failures never reach this type; the sink logs and counts them.
//! - **Configuration**: `Config` wraps `figment` load errors and `Configuration` carries
//!   semantic validation failures.
//!
//! A malformed trigger (unparseable angle) and a user interrupt are deliberately not
//! errors: the first is recorded with an unknown angle and the second ends the run as
//! `RunStatus::Interrupted`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Failure of a single sensor grab.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrabError {
    /// The sensor did not deliver a frame within the grab timeout.
    #[error("Sensor grab timed out after {0:?}")]
    Timeout(Duration),

    /// The sensor reported a failed acquisition.
    #[error("Sensor grab failed: {0}")]
    Failed(String),
}

/// Primary error type for the acquisition run.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Controller did not report home position within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Controller sent no capture request within {0:?}")]
    TriggerTimeout(Duration),

    #[error("No line from controller within {0:?}")]
    LinkTimeout(Duration),

    #[error("Controller link is closed")]
    SerialPortNotConnected,

    #[error("Unexpected EOF from controller link")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Step {step}: grab failed {attempts} times, last error: {last}")]
    GrabRetriesExhausted {
        step: u32,
        attempts: u32,
        last: GrabError,
    },

    #[error("Report error: {0}")]
    Report(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Spectrometer error: {0}")]
    Spectrometer(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for CaptureError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
