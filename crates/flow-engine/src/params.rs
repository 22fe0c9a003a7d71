//! Typed block parameters.
//!
//! The editor stores a string-keyed `params` bag per block. Loading a flow
//! parses each bag once into a [`BlockParams`] variant so the interpreter
//! can match exhaustively instead of probing keys at every step.

use crate::types::BlockType;
use serde::{Deserialize, Serialize};

/// What to do after a block's retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnFailure {
    Abort,
    Continue,
    Goto,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Abort
    }
}

/// Optional error-handling overlay accepted by every block type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorPolicy {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub on_failure: OnFailure,
    /// Recovery block id or label, required when `onFailure` is `goto`.
    pub error_target: Option<String>,
    /// Raise an operator notification alongside the session error entry.
    pub error_notification: bool,
}

/// Severity of a LOG block entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// A numeric parameter that is either a literal or a `{{variable}}`
/// reference resolved at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrVar {
    Literal(f64),
    Reference(String),
}

impl NumberOrVar {
    /// The referenced variable id, if this is a `{{id}}` token.
    pub fn variable_id(&self) -> Option<&str> {
        match self {
            NumberOrVar::Reference(raw) => raw
                .strip_prefix("{{")
                .and_then(|s| s.strip_suffix("}}"))
                .map(str::trim),
            NumberOrVar::Literal(_) => None,
        }
    }

    /// A literal value, either native or a numeric string.
    pub fn literal(&self) -> Option<f64> {
        match self {
            NumberOrVar::Literal(n) => Some(*n),
            NumberOrVar::Reference(raw) => raw.parse::<f64>().ok(),
        }
    }
}

/// Comparison operators with numeric coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogParams {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitParams {
    /// Milliseconds; literal or variable.
    pub duration: NumberOrVar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadParams {
    pub device_id: String,
    /// Local variable id receiving the vetted value.
    pub variable: String,
}

/// Actuator actions. Timed variants schedule a compensating command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorAction {
    On,
    Off,
    PulseOn,
    PulseOff,
    Dose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorSetParams {
    pub device_id: String,
    pub action: ActuatorAction,
    /// Pulse duration in ms (PULSE_ON / PULSE_OFF).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<NumberOrVar>,
    /// Number of nominal doses (DOSE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<NumberOrVar>,
    /// Explicit volume in ml (DOSE); wins over `amount`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<NumberOrVar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionParams {
    pub variable: String,
    pub operator: CompareOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopMode {
    Count,
    While,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopParams {
    pub mode: LoopMode,
    /// COUNT mode: iterations; literal or variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<NumberOrVar>,
    /// WHILE mode condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<CompareOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// WHILE mode runaway guard.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowControlType {
    Label,
    Goto,
    LoopBack,
    LoopBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowControlParams {
    pub control_type: FlowControlType,
    /// LABEL: this block's anchor name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// GOTO / LOOP_BACK: label name or block id to jump to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Parsed parameters, one variant per block type.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockParams {
    Start,
    End,
    Log(LogParams),
    Wait(WaitParams),
    SensorRead(SensorReadParams),
    ActuatorSet(ActuatorSetParams),
    Condition(ConditionParams),
    Loop(LoopParams),
    FlowControl(FlowControlParams),
}

impl BlockParams {
    /// Parse a raw params bag for the given block type.
    pub fn parse(
        block_type: BlockType,
        raw: &serde_json::Value,
    ) -> std::result::Result<Self, String> {
        let value = match raw {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        let parsed = match block_type {
            BlockType::Start => BlockParams::Start,
            BlockType::End => BlockParams::End,
            BlockType::Log => BlockParams::Log(from(value)?),
            BlockType::Wait => BlockParams::Wait(from(value)?),
            BlockType::SensorRead => BlockParams::SensorRead(from(value)?),
            BlockType::ActuatorSet => BlockParams::ActuatorSet(from(value)?),
            BlockType::Condition => BlockParams::Condition(from(value)?),
            BlockType::Loop => BlockParams::Loop(from(value)?),
            BlockType::FlowControl => BlockParams::FlowControl(from(value)?),
        };
        Ok(parsed)
    }
}

fn from<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Parse the error-handling overlay out of a raw params bag. Every block
/// type accepts one; unknown keys are ignored, but a malformed overlay
/// (wrong case, wrong type) is an error rather than a silent default.
pub fn parse_policy(raw: &serde_json::Value) -> std::result::Result<ErrorPolicy, String> {
    match raw {
        serde_json::Value::Object(_) => {
            serde_json::from_value(raw.clone()).map_err(|e| e.to_string())
        }
        _ => Ok(ErrorPolicy::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actuator_params_from_editor_json() {
        let raw = json!({
            "deviceId": "pump-1",
            "action": "DOSE",
            "amount": 2.0,
            "retryCount": 1,
            "onFailure": "continue"
        });
        let params = BlockParams::parse(BlockType::ActuatorSet, &raw).unwrap();
        let BlockParams::ActuatorSet(p) = params else {
            panic!("wrong variant");
        };
        assert_eq!(p.device_id, "pump-1");
        assert_eq!(p.action, ActuatorAction::Dose);
        assert_eq!(p.amount, Some(NumberOrVar::Literal(2.0)));

        let policy = parse_policy(&raw).unwrap();
        assert_eq!(policy.retry_count, 1);
        assert_eq!(policy.on_failure, OnFailure::Continue);
    }

    #[test]
    fn test_number_or_var_reference() {
        let duration: NumberOrVar = serde_json::from_value(json!("{{wait_ms}}")).unwrap();
        assert_eq!(duration.variable_id(), Some("wait_ms"));
        assert_eq!(duration.literal(), None);

        let literal: NumberOrVar = serde_json::from_value(json!(1500)).unwrap();
        assert_eq!(literal.literal(), Some(1500.0));

        let numeric_string: NumberOrVar = serde_json::from_value(json!("250")).unwrap();
        assert_eq!(numeric_string.literal(), Some(250.0));
    }

    #[test]
    fn test_compare_op_wire_names() {
        let op: CompareOp = serde_json::from_value(json!(">=")).unwrap();
        assert_eq!(op, CompareOp::Ge);
        assert_eq!(serde_json::to_value(CompareOp::Ne).unwrap(), json!("!="));
    }

    #[test]
    fn test_loop_params_defaults() {
        let raw = json!({"mode": "WHILE", "variable": "level", "operator": "<", "value": 10});
        let BlockParams::Loop(p) = BlockParams::parse(BlockType::Loop, &raw).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(p.mode, LoopMode::While);
        assert_eq!(p.max_iterations, 1000);
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let raw = json!({"level": "info"});
        assert!(BlockParams::parse(BlockType::Log, &raw).is_err());
    }

    #[test]
    fn test_policy_defaults_on_empty_bag() {
        let policy = parse_policy(&serde_json::Value::Null).unwrap();
        assert_eq!(policy.retry_count, 0);
        assert_eq!(policy.on_failure, OnFailure::Abort);
        assert!(!policy.error_notification);
    }

    #[test]
    fn test_malformed_policy_rejected() {
        // Wrong case on the variant name.
        assert!(parse_policy(&json!({"onFailure": "Goto"})).is_err());
        // Wrong type on a count.
        assert!(parse_policy(&json!({"retryCount": "3"})).is_err());
    }
}
