//! Flow graph types as produced by the editor.
//!
//! These are the raw, serde-facing shapes. Loading a flow parses the
//! string-keyed `params` bags into typed [`crate::params::BlockParams`]
//! and resolves all jump targets; see [`crate::validation`].

use serde::{Deserialize, Serialize};

/// The kind of step a block performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    Start,
    End,
    Log,
    Wait,
    SensorRead,
    ActuatorSet,
    Condition,
    Loop,
    FlowControl,
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockType::Start => "START",
            BlockType::End => "END",
            BlockType::Log => "LOG",
            BlockType::Wait => "WAIT",
            BlockType::SensorRead => "SENSOR_READ",
            BlockType::ActuatorSet => "ACTUATOR_SET",
            BlockType::Condition => "CONDITION",
            BlockType::Loop => "LOOP",
            BlockType::FlowControl => "FLOW_CONTROL",
        };
        write!(f, "{name}")
    }
}

/// One node in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Type-specific parameter bag; parsed once at load time.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Default successor. Absent for END and for blocks whose successors
    /// come from labelled edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// SENSOR_READ only: copy another block's configuration at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_of: Option<String>,
    /// Editor canvas position; carried through untouched.
    #[serde(default)]
    pub position: (f64, f64),
}

impl Block {
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            params: serde_json::Value::Null,
            next: None,
            mirror_of: None,
            position: (0.0, 0.0),
        }
    }
}

/// A labelled transition between two blocks.
///
/// Handles: `next` (default), `true`/`false` (CONDITION), `body`/`after`
/// (LOOP).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub source_handle: String,
    pub target: String,
}

/// Declared value type of a flow variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Number,
    String,
    Boolean,
}

/// Variable visibility.
///
/// Local variables hold ephemeral/sensor-derived values; globals are
/// caller-supplied inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    Local,
    Global,
}

/// A variable declaration on a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDecl {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub scope: VarScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Global-only: missing caller value is tolerated instead of fatal.
    #[serde(default)]
    pub tolerant: bool,
}

impl VariableDecl {
    pub fn local(id: impl Into<String>, name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            var_type,
            scope: VarScope::Local,
            default: None,
            tolerant: false,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// An editable flow graph: blocks, labelled edges, and variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
}

impl FlowGraph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            blocks: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn find_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Target of the edge leaving `source` through `handle`, if any.
    pub fn edge_target(&self, source: &str, handle: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.source_handle == handle)
            .map(|e| e.target.as_str())
    }
}
