//! Error types for the flow engine.

use crate::validation::ValidationError;
use thiserror::Error;

/// Errors raised while loading or executing a flow.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The graph failed validation; all problems are collected.
    #[error("flow validation failed: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    /// A value context referenced a variable with no value. Never
    /// substituted with zero.
    #[error("block '{block_id}' references variable '{variable}' which has no value")]
    UnresolvedVariable { block_id: String, variable: String },

    #[error("variable '{0}' is not declared in this flow")]
    UnknownVariable(String),

    /// WHILE loop runaway guard tripped.
    #[error("loop '{block_id}' exceeded its runaway guard of {max_iterations} iterations")]
    RunawayGuard {
        block_id: String,
        max_iterations: u32,
    },

    /// Whole-session step guard tripped.
    #[error("session exceeded the step limit of {limit}")]
    StepLimitExceeded { limit: u64 },

    #[error("LOOP_BREAK in block '{block_id}' with no enclosing loop")]
    LoopBreakOutsideLoop { block_id: String },

    /// A hardware action failed and the block's policy said abort.
    #[error("block '{block_id}' hardware action failed: {message}")]
    Hardware { block_id: String, message: String },

    /// A compensating actuator command failed. Safety-critical; never
    /// downgraded by block policy.
    #[error("compensating command for device '{device_id}' failed: {detail}")]
    CompensationFailed { device_id: String, detail: String },

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
