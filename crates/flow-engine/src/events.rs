//! Event streaming abstraction.
//!
//! The engine emits events through an [`EventSink`] so hosts (UI, logging,
//! tests) can observe execution without the engine depending on them.

use crate::params::LogLevel;
use crate::session::SessionStatus;
use serde::{Deserialize, Serialize};

/// Error from an event sink. Sinks are observers; delivery failures are
/// logged, never allowed to fail the flow.
#[derive(Debug, thiserror::Error)]
#[error("event sink error: {0}")]
pub struct EventError(pub String);

/// Events emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEvent {
    #[serde(rename_all = "camelCase")]
    SessionStateChanged {
        session_id: String,
        status: SessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    BlockStarted {
        session_id: String,
        block_id: String,
        block_type: String,
    },
    #[serde(rename_all = "camelCase")]
    BlockCompleted {
        session_id: String,
        block_id: String,
    },
    #[serde(rename_all = "camelCase")]
    BlockFailed {
        session_id: String,
        block_id: String,
        error: String,
        /// False once retries are exhausted.
        will_retry: bool,
    },
    #[serde(rename_all = "camelCase")]
    LogEmitted {
        session_id: String,
        level: LogLevel,
        message: String,
    },
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent) -> Result<(), EventError>;
}

/// Sink that discards all events.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: FlowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Sink that collects events in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<FlowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: FlowEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|e| EventError(e.to_string()))?
            .push(event);
        Ok(())
    }
}
