//! Custom error types for the application.
//!
//! `DaqError` is the single error type shared by the transports, the
//! instrument drivers and the coordinator. Drivers are expected to catch the
//! transport-level variants themselves and turn them into sentinel values or
//! log lines; only configuration and discovery failures travel further up.
//!
//! ## Error Hierarchy
//!
//! - **`NotConnected`**: the channel is closed or the instrument is unreachable.
//!   Always recoverable; the next poll cycle retries.
//! - **`Transport`** / **`Io`** / **`Serial`**: I/O failed on an open channel.
//! - **`InvalidSetting`**: a validated property (port name, settle time) was
//!   rejected. The previous value is kept.
//! - **`OutOfRange`**: a motion target lies outside the travel limits. Raised
//!   before any device I/O.
//! - **`DeviceNotFound`**: lock-in discovery found nothing.
//! - **`Protocol`**: a response could not be parsed.
//! - **`Instrument`**: the vendor data server reported an error.
//! - **`Config`** / **`Configuration`** / **`ParameterFile`**: loading or
//!   validating settings and the lock-in parameter tree.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Instrument not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Target {target} outside travel limits [{min}, {max}]")]
    OutOfRange { target: f64, min: f64, max: f64 },

    #[error("Position not confirmed by the controller")]
    PositionUnknown,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Parameter file error: {0}")]
    ParameterFile(#[from] serde_yaml::Error),
}

impl DaqError {
    /// True for the transport-unavailable condition that drivers map to
    /// sentinel values instead of surfacing.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, DaqError::NotConnected)
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
