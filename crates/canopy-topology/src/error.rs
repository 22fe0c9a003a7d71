//! Error types for the topology store.

use thiserror::Error;

/// Errors raised by topology lookups and port allocation.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// A requested port is already owned by a different entity.
    #[error("port {port_id} on controller {controller_id} is already occupied by {owner_kind} '{owner_name}'")]
    PortConflict {
        controller_id: String,
        port_id: String,
        owner_kind: String,
        owner_name: String,
    },

    /// A requested relay channel is already owned by a different entity.
    #[error("channel {channel} on relay {relay_id} is already occupied by '{owner_name}'")]
    ChannelConflict {
        relay_id: String,
        channel: u8,
        owner_name: String,
    },

    #[error("controller not found: {0}")]
    UnknownController(String),

    #[error("port {port_id} does not exist on controller {controller_id}")]
    UnknownPort {
        controller_id: String,
        port_id: String,
    },

    #[error("port {port_id} on controller {controller_id} is administratively disabled")]
    InactivePort {
        controller_id: String,
        port_id: String,
    },

    #[error("relay board not found: {0}")]
    UnknownRelay(String),

    #[error("channel {channel} does not exist on relay {relay_id}")]
    UnknownChannel { relay_id: String, channel: u8 },

    #[error("device not found: {0}")]
    UnknownDevice(String),

    #[error("device '{0}' is disabled")]
    DeviceDisabled(String),
}

/// Convenience result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;
