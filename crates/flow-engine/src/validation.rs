//! Flow validation and compilation.
//!
//! A single pass over the raw graph produces an index-based
//! [`CompiledFlow`]: params bags parsed into typed variants, mirrors
//! materialized as copies, every successor and jump target resolved to a
//! block index. All problems are collected, not just the first; a graph
//! with any error never reaches `running`.

use crate::params::{
    BlockParams, ErrorPolicy, FlowControlType, LoopMode, NumberOrVar, OnFailure,
};
use crate::types::{Block, BlockType, FlowGraph, VariableDecl};
use std::collections::{HashMap, HashSet};

/// A problem found while validating a flow graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No START block in the graph.
    MissingStart,
    /// More than one START block.
    MultipleStart { count: usize },
    /// An edge or `next` points at a block that doesn't exist.
    UnknownBlock { from: String, target: String },
    /// A block is missing a required successor.
    MissingSuccessor { block_id: String, handle: String },
    /// A GOTO/LOOP_BACK target resolves to nothing (or the wrong kind).
    UnknownJumpTarget { block_id: String, target: String },
    /// Two LABEL anchors share a name.
    DuplicateLabel { label: String },
    /// Two variables share an id.
    DuplicateVariable { id: String },
    /// A block references a variable the flow doesn't declare.
    UnknownVariable { block_id: String, variable: String },
    /// The params bag doesn't parse for the block's type.
    InvalidParams { block_id: String, detail: String },
    /// A `mirrorOf` reference is unusable.
    InvalidMirror { block_id: String, detail: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingStart => write!(f, "flow has no START block"),
            ValidationError::MultipleStart { count } => {
                write!(f, "flow has {count} START blocks, expected exactly one")
            }
            ValidationError::UnknownBlock { from, target } => {
                write!(f, "block '{from}' points at unknown block '{target}'")
            }
            ValidationError::MissingSuccessor { block_id, handle } => {
                write!(f, "block '{block_id}' is missing its '{handle}' successor")
            }
            ValidationError::UnknownJumpTarget { block_id, target } => {
                write!(f, "block '{block_id}' jump target '{target}' cannot be resolved")
            }
            ValidationError::DuplicateLabel { label } => {
                write!(f, "label '{label}' is declared more than once")
            }
            ValidationError::DuplicateVariable { id } => {
                write!(f, "variable id '{id}' is declared more than once")
            }
            ValidationError::UnknownVariable { block_id, variable } => {
                write!(f, "block '{block_id}' references undeclared variable '{variable}'")
            }
            ValidationError::InvalidParams { block_id, detail } => {
                write!(f, "block '{block_id}' has invalid params: {detail}")
            }
            ValidationError::InvalidMirror { block_id, detail } => {
                write!(f, "block '{block_id}' has an invalid mirror: {detail}")
            }
        }
    }
}

/// One block of a compiled flow. All successor fields are indices into
/// [`CompiledFlow::blocks`].
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub id: String,
    pub block_type: BlockType,
    pub params: BlockParams,
    pub policy: ErrorPolicy,
    /// Default successor.
    pub next: Option<usize>,
    /// CONDITION successors.
    pub on_true: Option<usize>,
    pub on_false: Option<usize>,
    /// LOOP successors.
    pub body: Option<usize>,
    pub after: Option<usize>,
    /// GOTO / LOOP_BACK target.
    pub jump: Option<usize>,
    /// Recovery block for `onFailure: goto`.
    pub error_jump: Option<usize>,
}

/// An immutable, index-based execution graph.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub flow_id: String,
    pub name: String,
    pub start: usize,
    pub blocks: Vec<CompiledBlock>,
    pub variables: Vec<VariableDecl>,
}

/// Validate a graph without keeping the compiled form.
pub fn validate_flow(graph: &FlowGraph) -> Result<(), Vec<ValidationError>> {
    compile_flow(graph).map(|_| ())
}

/// Validate and compile a flow graph.
pub fn compile_flow(graph: &FlowGraph) -> Result<CompiledFlow, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let blocks = materialize_mirrors(graph, &mut errors);

    let index: HashMap<&str, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.as_str(), i))
        .collect();

    // Variable declarations
    let mut declared: HashSet<&str> = HashSet::new();
    for decl in &graph.variables {
        if !declared.insert(decl.id.as_str()) {
            errors.push(ValidationError::DuplicateVariable {
                id: decl.id.clone(),
            });
        }
    }

    // Parse every params bag up front.
    let mut parsed: Vec<Option<BlockParams>> = Vec::with_capacity(blocks.len());
    for block in &blocks {
        match BlockParams::parse(block.block_type, &block.params) {
            Ok(params) => parsed.push(Some(params)),
            Err(detail) => {
                errors.push(ValidationError::InvalidParams {
                    block_id: block.id.clone(),
                    detail,
                });
                parsed.push(None);
            }
        }
    }

    // Jump table: label name -> block index.
    let mut labels: HashMap<String, usize> = HashMap::new();
    for (i, params) in parsed.iter().enumerate() {
        if let Some(BlockParams::FlowControl(fc)) = params {
            if fc.control_type == FlowControlType::Label {
                match &fc.label {
                    Some(name) => {
                        if labels.insert(name.clone(), i).is_some() {
                            errors.push(ValidationError::DuplicateLabel { label: name.clone() });
                        }
                    }
                    None => errors.push(ValidationError::InvalidParams {
                        block_id: blocks[i].id.clone(),
                        detail: "LABEL requires a label name".to_string(),
                    }),
                }
            }
        }
    }

    // START cardinality
    let starts: Vec<usize> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.block_type == BlockType::Start)
        .map(|(i, _)| i)
        .collect();
    match starts.len() {
        0 => errors.push(ValidationError::MissingStart),
        1 => {}
        count => errors.push(ValidationError::MultipleStart { count }),
    }

    let mut compiled: Vec<CompiledBlock> = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        let params = match &parsed[i] {
            Some(p) => p.clone(),
            // Placeholder; errors are non-empty so this never executes.
            None => BlockParams::End,
        };
        let policy = match crate::params::parse_policy(&block.params) {
            Ok(policy) => policy,
            Err(detail) => {
                errors.push(ValidationError::InvalidParams {
                    block_id: block.id.clone(),
                    detail,
                });
                ErrorPolicy::default()
            }
        };
        let mut out = CompiledBlock {
            id: block.id.clone(),
            block_type: block.block_type,
            params: params.clone(),
            policy: policy.clone(),
            next: None,
            on_true: None,
            on_false: None,
            body: None,
            after: None,
            jump: None,
            error_jump: None,
        };

        let resolve = |target: &str, errors: &mut Vec<ValidationError>| -> Option<usize> {
            match index.get(target) {
                Some(&idx) => Some(idx),
                None => {
                    errors.push(ValidationError::UnknownBlock {
                        from: block.id.clone(),
                        target: target.to_string(),
                    });
                    None
                }
            }
        };

        // Default successor: the block's `next` field, else its `next` edge.
        let next_target = block
            .next
            .as_deref()
            .or_else(|| graph.edge_target(&block.id, "next"));
        if let Some(target) = next_target {
            out.next = resolve(target, &mut errors);
        }

        match &params {
            BlockParams::Condition(p) => {
                for (handle, slot) in [("true", &mut out.on_true), ("false", &mut out.on_false)] {
                    match graph.edge_target(&block.id, handle) {
                        Some(target) => *slot = resolve(target, &mut errors),
                        None => errors.push(ValidationError::MissingSuccessor {
                            block_id: block.id.clone(),
                            handle: handle.to_string(),
                        }),
                    }
                }
                check_variable(&declared, &block.id, &p.variable, &mut errors);
            }
            BlockParams::Loop(p) => {
                for (handle, slot) in [("body", &mut out.body), ("after", &mut out.after)] {
                    match graph.edge_target(&block.id, handle) {
                        Some(target) => *slot = resolve(target, &mut errors),
                        None => errors.push(ValidationError::MissingSuccessor {
                            block_id: block.id.clone(),
                            handle: handle.to_string(),
                        }),
                    }
                }
                match p.mode {
                    LoopMode::Count => {
                        match &p.count {
                            Some(count) => {
                                check_number_or_var(&declared, &block.id, count, &mut errors)
                            }
                            None => errors.push(ValidationError::InvalidParams {
                                block_id: block.id.clone(),
                                detail: "COUNT loop requires a count".to_string(),
                            }),
                        }
                    }
                    LoopMode::While => {
                        if p.operator.is_none() || p.value.is_none() {
                            errors.push(ValidationError::InvalidParams {
                                block_id: block.id.clone(),
                                detail: "WHILE loop requires variable, operator and value"
                                    .to_string(),
                            });
                        }
                        match &p.variable {
                            Some(variable) => {
                                check_variable(&declared, &block.id, variable, &mut errors)
                            }
                            None => errors.push(ValidationError::InvalidParams {
                                block_id: block.id.clone(),
                                detail: "WHILE loop requires a variable".to_string(),
                            }),
                        }
                    }
                }
            }
            BlockParams::FlowControl(fc) => match fc.control_type {
                FlowControlType::Label => require_next(&out, block, &mut errors),
                FlowControlType::Goto | FlowControlType::LoopBack => {
                    match &fc.target {
                        None => errors.push(ValidationError::InvalidParams {
                            block_id: block.id.clone(),
                            detail: "jump requires a target".to_string(),
                        }),
                        Some(target) => {
                            // Labels first, block ids second.
                            let resolved =
                                labels.get(target).copied().or_else(|| index.get(target.as_str()).copied());
                            match resolved {
                                Some(idx) => {
                                    if fc.control_type == FlowControlType::LoopBack
                                        && blocks[idx].block_type != BlockType::Loop
                                    {
                                        errors.push(ValidationError::UnknownJumpTarget {
                                            block_id: block.id.clone(),
                                            target: target.clone(),
                                        });
                                    } else {
                                        out.jump = Some(idx);
                                    }
                                }
                                None => errors.push(ValidationError::UnknownJumpTarget {
                                    block_id: block.id.clone(),
                                    target: target.clone(),
                                }),
                            }
                        }
                    }
                }
                FlowControlType::LoopBreak => {}
            },
            BlockParams::Start => require_next(&out, block, &mut errors),
            BlockParams::Log(p) => {
                require_next(&out, block, &mut errors);
                for token in message_tokens(&p.message) {
                    check_variable(&declared, &block.id, &token, &mut errors);
                }
            }
            BlockParams::Wait(p) => {
                require_next(&out, block, &mut errors);
                check_number_or_var(&declared, &block.id, &p.duration, &mut errors);
            }
            BlockParams::SensorRead(p) => {
                require_next(&out, block, &mut errors);
                check_variable(&declared, &block.id, &p.variable, &mut errors);
            }
            BlockParams::ActuatorSet(p) => {
                require_next(&out, block, &mut errors);
                use crate::params::ActuatorAction::*;
                match p.action {
                    PulseOn | PulseOff => match &p.duration_ms {
                        Some(duration) => {
                            check_number_or_var(&declared, &block.id, duration, &mut errors)
                        }
                        None => errors.push(ValidationError::InvalidParams {
                            block_id: block.id.clone(),
                            detail: "pulse requires a duration".to_string(),
                        }),
                    },
                    Dose => {
                        if p.amount.is_none() && p.volume_ml.is_none() {
                            errors.push(ValidationError::InvalidParams {
                                block_id: block.id.clone(),
                                detail: "DOSE requires an amount or a volume".to_string(),
                            });
                        }
                        for value in p.amount.iter().chain(p.volume_ml.iter()) {
                            check_number_or_var(&declared, &block.id, value, &mut errors);
                        }
                    }
                    On | Off => {}
                }
            }
            BlockParams::End => {}
        }

        // Recovery target for the failure overlay.
        if policy.on_failure == OnFailure::Goto {
            match &policy.error_target {
                Some(target) => {
                    let resolved =
                        labels.get(target).copied().or_else(|| index.get(target.as_str()).copied());
                    match resolved {
                        Some(idx) => out.error_jump = Some(idx),
                        None => errors.push(ValidationError::UnknownJumpTarget {
                            block_id: block.id.clone(),
                            target: target.clone(),
                        }),
                    }
                }
                None => errors.push(ValidationError::InvalidParams {
                    block_id: block.id.clone(),
                    detail: "onFailure goto requires an errorTarget".to_string(),
                }),
            }
        }

        compiled.push(out);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(CompiledFlow {
        flow_id: graph.id.clone(),
        name: graph.name.clone(),
        start: starts[0],
        blocks: compiled,
        variables: graph.variables.clone(),
    })
}

/// Copy mirrored params into mirror blocks. A mirror is a copy taken now;
/// later edits to the source never reach already-compiled graphs.
fn materialize_mirrors(graph: &FlowGraph, errors: &mut Vec<ValidationError>) -> Vec<Block> {
    let mut blocks = graph.blocks.clone();
    for block in blocks.iter_mut() {
        let Some(source_id) = block.mirror_of.clone() else {
            continue;
        };
        if block.block_type != BlockType::SensorRead {
            errors.push(ValidationError::InvalidMirror {
                block_id: block.id.clone(),
                detail: "only SENSOR_READ blocks may mirror".to_string(),
            });
            continue;
        }
        let Some(source) = graph.find_block(&source_id) else {
            errors.push(ValidationError::InvalidMirror {
                block_id: block.id.clone(),
                detail: format!("mirror source '{source_id}' does not exist"),
            });
            continue;
        };
        if source.block_type != BlockType::SensorRead {
            errors.push(ValidationError::InvalidMirror {
                block_id: block.id.clone(),
                detail: format!("mirror source '{source_id}' is not a SENSOR_READ block"),
            });
            continue;
        }
        if source.mirror_of.is_some() {
            errors.push(ValidationError::InvalidMirror {
                block_id: block.id.clone(),
                detail: format!("mirror source '{source_id}' is itself a mirror"),
            });
            continue;
        }
        block.params = source.params.clone();
    }
    blocks
}

fn require_next(out: &CompiledBlock, block: &Block, errors: &mut Vec<ValidationError>) {
    if out.next.is_none() && block.next.is_none() {
        errors.push(ValidationError::MissingSuccessor {
            block_id: block.id.clone(),
            handle: "next".to_string(),
        });
    }
}

fn check_variable(
    declared: &HashSet<&str>,
    block_id: &str,
    variable: &str,
    errors: &mut Vec<ValidationError>,
) {
    if !declared.contains(variable) {
        errors.push(ValidationError::UnknownVariable {
            block_id: block_id.to_string(),
            variable: variable.to_string(),
        });
    }
}

fn check_number_or_var(
    declared: &HashSet<&str>,
    block_id: &str,
    value: &NumberOrVar,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(var_id) = value.variable_id() {
        check_variable(declared, block_id, var_id, errors);
    } else if value.literal().is_none() {
        errors.push(ValidationError::InvalidParams {
            block_id: block_id.to_string(),
            detail: "value is neither a number nor a {{variable}} reference".to_string(),
        });
    }
}

/// `{{id}}` tokens in a LOG message.
fn message_tokens(message: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = message;
    while let Some(start) = rest.find("{{") {
        let tail = &rest[start + 2..];
        match tail.find("}}") {
            Some(end) => {
                tokens.push(tail[..end].trim().to_string());
                rest = &tail[end + 2..];
            }
            None => break,
        }
    }
    tokens
}
