//! Error types for catalog construction, command compilation, transport
//! and the sampling pipeline.

use thiserror::Error;

/// Errors detected while building a catalog snapshot.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("template '{0}' declares no port requirements")]
    NoPortRequirements(String),

    #[error("template '{0}' command sequence does not match its strategy (non-empty iff multi_step)")]
    CommandSequenceMismatch(String),

    #[error("duplicate command definition: {0}")]
    DuplicateCommand(String),

    #[error("duplicate template: {0}")]
    DuplicateTemplate(String),
}

/// Errors from the command compiler. Always abort the requested operation;
/// a partial command is never sent.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("device '{device_id}' has no command: template declares neither requiredCommand nor executionConfig.commandType")]
    NoCommand { device_id: String },

    #[error("device '{device_id}' references unknown command '{command}'")]
    UnknownCommand { device_id: String, command: String },

    #[error("device '{device_id}' port token '{port_id}' is not a valid pin")]
    InvalidPort { device_id: String, port_id: String },

    #[error("device '{device_id}' command '{command}' is missing required parameters: {}", missing.join(", "))]
    MissingParameters {
        device_id: String,
        command: String,
        missing: Vec<String>,
    },

    #[error("device '{device_id}' has no usable calibration: {detail}")]
    NoCalibration { device_id: String, detail: String },

    #[error("device '{device_id}' display unit '{unit}' is not a volume unit; refusing to dose")]
    UnitMismatch { device_id: String, unit: String },
}

/// Errors from the hardware transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("controller '{controller_id}' timed out after {timeout_ms}ms")]
    Timeout {
        controller_id: String,
        timeout_ms: u64,
    },

    #[error("controller '{controller_id}' returned no response")]
    NoResponse { controller_id: String },

    #[error("controller '{controller_id}' returned a malformed response: {detail}")]
    Malformed {
        controller_id: String,
        detail: String,
    },

    #[error("connection to controller '{controller_id}' is closed")]
    Closed { controller_id: String },
}

/// Errors from the sampling & validation pipeline.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reading outside the declared hardware range.
    #[error("device '{device_id}' reading {value} outside range [{min}, {max}]")]
    OutOfRange {
        device_id: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("device '{device_id}' response value '{raw}' is not numeric")]
    NonNumeric { device_id: String, raw: String },

    /// Fallback refused: the sensor has been failing too long to keep
    /// masking it with stale or default values.
    #[error("device '{device_id}' considered stale after {consecutive_failures} consecutive failures")]
    StaleSensor {
        device_id: String,
        consecutive_failures: u32,
    },

    #[error("device '{device_id}' has no last valid reading to fall back on")]
    NoLastValid { device_id: String },

    #[error("device '{device_id}' has no default value configured for fallback")]
    NoDefault { device_id: String },
}
