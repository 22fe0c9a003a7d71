//! Canopy Automation Service - flows, sessions, and real hardware
//!
//! This crate wires the three lower layers together:
//!
//! - `store`: the flow library, in memory with optional JSON persistence
//! - `bridge`: the production [`flow_engine::HardwareBridge`], turning a
//!   block's device id into compiled commands and vetted readings via the
//!   topology store, the capability catalog, and the transport
//! - `sessions`: the [`SessionManager`], which loads flows into sessions
//!   and drives pause/resume/stop over each session's control channel
//!
//! # Example
//!
//! ```ignore
//! use canopy_automation_service::{CanopyBridge, FlowStore, SessionManager};
//! use std::sync::Arc;
//!
//! let bridge = Arc::new(CanopyBridge::new(topology, catalog, transport));
//! let manager = SessionManager::new(bridge, events, FlowStore::new());
//! let session_id = manager.load_flow("nutrient-check")?;
//! manager.start(&session_id, Default::default())?;
//! ```

pub mod bridge;
pub mod error;
pub mod sessions;
pub mod store;

pub use bridge::CanopyBridge;
pub use error::{Result, ServiceError};
pub use sessions::SessionManager;
pub use store::{FlowMetadata, FlowStore};
