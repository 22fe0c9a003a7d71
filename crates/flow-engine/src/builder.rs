//! Fluent builder for flow graphs.
//!
//! Used by tests and by hosts that assemble flows programmatically rather
//! than loading editor JSON.

use crate::types::{Block, BlockType, FlowEdge, FlowGraph, VariableDecl};
use serde_json::json;

/// Fluent builder for [`FlowGraph`].
///
/// # Example
///
/// ```ignore
/// let graph = FlowBuilder::new("flow-1", "pH check")
///     .start("s", "read")
///     .sensor_read("read", "ph-probe", "ph", "check")
///     .condition("check", "ph", "<", serde_json::json!(6.0))
///     .edge("check", "true", "dose")
///     .edge("check", "false", "done")
///     .actuator_set("dose", serde_json::json!({
///         "deviceId": "pump-1", "action": "DOSE", "amount": 1
///     }), "done")
///     .end("done")
///     .build();
/// ```
pub struct FlowBuilder {
    id: String,
    name: String,
    blocks: Vec<Block>,
    edges: Vec<FlowEdge>,
    variables: Vec<VariableDecl>,
    edge_counter: usize,
}

impl FlowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            blocks: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            edge_counter: 0,
        }
    }

    fn push(mut self, mut block: Block, next: Option<&str>) -> Self {
        block.next = next.map(str::to_string);
        self.blocks.push(block);
        self
    }

    /// Add the START block.
    pub fn start(self, id: impl Into<String>, next: &str) -> Self {
        self.push(Block::new(id, BlockType::Start), Some(next))
    }

    /// Add an END block.
    pub fn end(self, id: impl Into<String>) -> Self {
        self.push(Block::new(id, BlockType::End), None)
    }

    /// Add a LOG block.
    pub fn log(self, id: impl Into<String>, message: &str, next: &str) -> Self {
        let mut block = Block::new(id, BlockType::Log);
        block.params = json!({ "message": message });
        self.push(block, Some(next))
    }

    /// Add a WAIT block with a literal duration.
    pub fn wait(self, id: impl Into<String>, duration_ms: u64, next: &str) -> Self {
        let mut block = Block::new(id, BlockType::Wait);
        block.params = json!({ "duration": duration_ms });
        self.push(block, Some(next))
    }

    /// Add a SENSOR_READ block.
    pub fn sensor_read(
        self,
        id: impl Into<String>,
        device_id: &str,
        variable: &str,
        next: &str,
    ) -> Self {
        let mut block = Block::new(id, BlockType::SensorRead);
        block.params = json!({ "deviceId": device_id, "variable": variable });
        self.push(block, Some(next))
    }

    /// Add an ACTUATOR_SET block with a raw params bag.
    pub fn actuator_set(
        self,
        id: impl Into<String>,
        params: serde_json::Value,
        next: &str,
    ) -> Self {
        let mut block = Block::new(id, BlockType::ActuatorSet);
        block.params = params;
        self.push(block, Some(next))
    }

    /// Add a CONDITION block; connect its branches with [`Self::edge`].
    pub fn condition(
        self,
        id: impl Into<String>,
        variable: &str,
        operator: &str,
        value: serde_json::Value,
    ) -> Self {
        let mut block = Block::new(id, BlockType::Condition);
        block.params = json!({ "variable": variable, "operator": operator, "value": value });
        self.push(block, None)
    }

    /// Add a LOOP block with a raw params bag; connect `body`/`after`
    /// with [`Self::edge`].
    pub fn loop_block(self, id: impl Into<String>, params: serde_json::Value) -> Self {
        let mut block = Block::new(id, BlockType::Loop);
        block.params = params;
        self.push(block, None)
    }

    /// Add a LABEL anchor.
    pub fn label(self, id: impl Into<String>, label: &str, next: &str) -> Self {
        let mut block = Block::new(id, BlockType::FlowControl);
        block.params = json!({ "controlType": "LABEL", "label": label });
        self.push(block, Some(next))
    }

    /// Add a GOTO jump.
    pub fn goto(self, id: impl Into<String>, target: &str) -> Self {
        let mut block = Block::new(id, BlockType::FlowControl);
        block.params = json!({ "controlType": "GOTO", "target": target });
        self.push(block, None)
    }

    /// Add a FLOW_CONTROL block with a raw params bag.
    pub fn flow_control(self, id: impl Into<String>, params: serde_json::Value) -> Self {
        let mut block = Block::new(id, BlockType::FlowControl);
        block.params = params;
        self.push(block, None)
    }

    /// Patch the most recently added block's params bag.
    ///
    /// Must be called immediately after adding the block.
    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(block) = self.blocks.last_mut() {
            if !block.params.is_object() {
                block.params = json!({});
            }
            block.params[key] = value;
        }
        self
    }

    /// Declare a variable.
    pub fn variable(mut self, decl: VariableDecl) -> Self {
        self.variables.push(decl);
        self
    }

    /// Add a labelled edge (auto-generates the edge id).
    pub fn edge(mut self, source: &str, handle: &str, target: &str) -> Self {
        self.edge_counter += 1;
        self.edges.push(FlowEdge {
            id: format!("edge-{}", self.edge_counter),
            source: source.to_string(),
            source_handle: handle.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Build the graph without validating it.
    pub fn build(self) -> FlowGraph {
        let mut graph = FlowGraph::new(self.id, self.name);
        graph.blocks = self.blocks;
        graph.edges = self.edges;
        graph.variables = self.variables;
        graph
    }
}
