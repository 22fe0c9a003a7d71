//! The hardware seam.
//!
//! The engine never talks to transports or the command compiler directly;
//! it calls a [`HardwareBridge`], implemented by the application service.
//! This keeps the interpreter testable with mock hardware.

use async_trait::async_trait;

/// How a bridge call failed. The kind decides whether the block's retry
/// policy applies: compile and conflict failures are deterministic and
/// retrying them is pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// Command compilation failed; not retryable.
    Compile,
    /// Wire-level failure; retryable.
    Transport,
    /// Reading failed validation; retryable.
    Validation,
    /// Sensor declared stale; not retryable within one block.
    Stale,
    /// Device/topology lookup failure; not retryable.
    Topology,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn new(kind: BridgeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            BridgeErrorKind::Transport | BridgeErrorKind::Validation
        )
    }
}

/// A vetted sensor read result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    Value(f64),
    /// The device's `skip` fallback fired; leave the variable untouched.
    Skipped,
}

/// Level to drive an actuator to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    On,
    Off,
}

impl ActuatorState {
    pub fn inverse(self) -> Self {
        match self {
            ActuatorState::On => ActuatorState::Off,
            ActuatorState::Off => ActuatorState::On,
        }
    }
}

/// A dosing request forwarded to the bridge for duration computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DoseSpec {
    VolumeMl(f64),
    Doses(f64),
}

/// Hardware capability consumed by the engine.
#[async_trait]
pub trait HardwareBridge: Send + Sync {
    /// Run one vetted read through the sampling pipeline.
    async fn read_sensor(&self, device_id: &str) -> Result<SensorReading, BridgeError>;

    /// Drive an actuator to a level.
    async fn set_actuator(&self, device_id: &str, state: ActuatorState)
        -> Result<(), BridgeError>;

    /// Convert a dose request into a pump run duration via the device's
    /// calibration.
    async fn dose_duration_ms(
        &self,
        device_id: &str,
        spec: DoseSpec,
    ) -> Result<u64, BridgeError>;
}
