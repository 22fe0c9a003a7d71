//! Canopy Topology - physical resource ownership for controllers and relays
//!
//! This crate is the single source of truth for "who may use which physical
//! line." It tracks:
//!
//! - Controllers and their ports (active/occupied/owner state)
//! - Relay boards and their channels (each wired to one controller port)
//! - Devices and their hardware bindings (direct pins or a relay channel)
//!
//! All occupancy mutations go through [`TopologyStore`], which runs every
//! check-then-reserve as a single critical section per controller (or per
//! relay), so two allocation requests can never both observe a port as free.

pub mod allocator;
pub mod error;
pub mod types;

pub use allocator::{ResolvedBinding, TopologyStore};
pub use error::{Result, TopologyError};
pub use types::{
    Controller, ControllerPort, Device, DeviceBinding, LastReading, PortKind, PortOwner,
    PortOwnerKind, RelayBoard, RelayChannel, ValueRange,
};
