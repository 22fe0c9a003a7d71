//! Canopy Hardware - turning abstract devices into wire commands and
//! trustworthy readings
//!
//! This crate holds everything between a device record and the bytes a
//! controller sees:
//!
//! - `catalog`: immutable snapshot of command definitions and device
//!   templates, built once and shared, never mutated under running sessions
//! - `compiler`: pure translation of a device + template into a concrete
//!   command payload (no transport, no topology writes)
//! - `transport`: the outbound seam, with per-controller serialized dispatch
//!   and per-command timeouts
//! - `sampling`: burst sampling, median reduction, range validation and
//!   retry/fallback policy for sensor reads

pub mod catalog;
pub mod compiler;
pub mod error;
pub mod sampling;
pub mod transport;

pub use catalog::{
    CalibrationConfig, CatalogBuilder, CatalogSnapshot, CommandDefinition, CommandParameter,
    DeviceTemplate, ExecutionConfig, ExecutionStrategy, ParamType, PortRequirement,
    ResponseMapping,
};
pub use compiler::{compile_command, dose_duration_ms, CommandPayload, DoseRequest};
pub use error::{CatalogError, CompileError, ReadError, TransportError};
pub use sampling::{FallbackAction, ReadOutcome, SamplingConfig, SamplingPipeline};
pub use transport::{CommandDispatcher, MockTransport, Transport, TransportResponse};
