//! Flow Engine - Graph-based automation flow execution for Canopy
//!
//! This crate interprets editor-authored flow graphs against real hardware
//! behind a trait seam. It supports:
//!
//! - Typed block parameters parsed once at load time
//! - Index-based execution with all jump targets resolved up front
//! - Conditional branching, COUNT/WHILE loops, and label/goto jumps
//! - Per-block retry and failure policies with recovery jumps
//! - Pause/resume/stop control and compensating actuator commands
//!
//! # Architecture
//!
//! A [`types::FlowGraph`] is what the editor saves. [`validation::compile_flow`]
//! checks it exhaustively and lowers it into a [`validation::CompiledFlow`],
//! which [`executor::FlowExecutor`] walks one block at a time. Hardware I/O
//! goes through the [`bridge::HardwareBridge`] trait so the interpreter stays
//! testable with mocks.
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::builder::FlowBuilder;
//! use flow_engine::validation::compile_flow;
//!
//! let graph = FlowBuilder::new("flow-1", "pH check")
//!     .start("s", "read")
//!     .sensor_read("read", "ph-probe", "ph", "done")
//!     .end("done")
//!     .build();
//! let flow = compile_flow(&graph).unwrap();
//! ```

pub mod bridge;
pub mod builder;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod params;
pub mod session;
pub mod types;
pub mod validation;

// Re-export key types
pub use bridge::{ActuatorState, BridgeError, BridgeErrorKind, DoseSpec, HardwareBridge, SensorReading};
pub use builder::FlowBuilder;
pub use context::{VarValue, VariableStore};
pub use error::{EngineError, Result};
pub use events::{EventError, EventSink, FlowEvent, NullEventSink, VecEventSink};
pub use executor::{control_channel, ControlSignal, FlowExecutor};
pub use session::{ExecutionSession, SessionStatus};
pub use types::{Block, BlockType, FlowGraph, VarScope, VarType, VariableDecl};
pub use validation::{compile_flow, validate_flow, CompiledFlow, ValidationError};
