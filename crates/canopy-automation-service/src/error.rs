//! Error types for the automation service.

use thiserror::Error;

/// Errors raised by flow storage and session orchestration.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("flow '{0}' not found")]
    FlowNotFound(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The session is not in a state that allows the requested operation.
    #[error("session '{session_id}' is {status}; cannot {requested}")]
    InvalidOperation {
        session_id: String,
        status: String,
        requested: String,
    },

    #[error("engine error: {0}")]
    Engine(#[from] flow_engine::EngineError),

    #[error("topology error: {0}")]
    Topology(#[from] canopy_topology::TopologyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
