//! Execution sessions and their state machine.

use crate::context::VarValue;
use crate::params::LogLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of one running flow:
/// `idle -> loaded -> running <-> paused -> {completed | failed | stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Loaded,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    /// Whether an externally requested transition is legal.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Idle, Loaded)
                | (Loaded, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Loaded => "loaded",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// One entry in a session's error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub block_id: Option<String>,
    pub message: String,
    /// Fatal errors end the session; non-fatal ones were tolerated by the
    /// block's failure policy.
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

impl SessionError {
    pub fn new(block_id: Option<String>, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            block_id,
            message: message.into(),
            fatal,
            timestamp: Utc::now(),
        }
    }
}

/// One entry in a session's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Runtime state of one execution of a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub id: String,
    pub flow_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_block_id: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub step_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<SessionError>,
    #[serde(default)]
    pub logs: Vec<SessionLogEntry>,
}

impl ExecutionSession {
    /// Fresh session for a flow, in `idle`.
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            status: SessionStatus::Idle,
            current_block_id: None,
            variables: BTreeMap::new(),
            step_count: 0,
            start_time: None,
            errors: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionStatus::*;
        assert!(Idle.can_transition(Loaded));
        assert!(Loaded.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Paused.can_transition(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionStatus::*;
        assert!(!Idle.can_transition(Running));
        assert!(!Completed.can_transition(Running));
        assert!(!Stopped.can_transition(Paused));
        assert!(!Loaded.can_transition(Paused));
    }

    #[test]
    fn test_new_session_shape() {
        let session = ExecutionSession::new("flow-1");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.step_count, 0);
        assert!(session.errors.is_empty());
        assert!(!session.has_fatal_error());
    }
}
