//! Runtime variable store and value semantics.

use crate::error::{EngineError, Result};
use crate::params::{CompareOp, NumberOrVar};
use crate::types::{VarType, VariableDecl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A runtime variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl VarValue {
    /// Numeric view, coercing numeric strings.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            VarValue::Number(n) => Some(*n),
            VarValue::Text(s) => s.parse::<f64>().ok(),
            VarValue::Bool(_) => None,
        }
    }

    /// Build from a JSON literal, coercing toward the declared type.
    pub fn from_json(declared: Option<VarType>, value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(VarValue::Number),
            serde_json::Value::Bool(b) => Some(VarValue::Bool(*b)),
            serde_json::Value::String(s) => match declared {
                Some(VarType::Number) => s.parse::<f64>().ok().map(VarValue::Number),
                Some(VarType::Boolean) => s.parse::<bool>().ok().map(VarValue::Bool),
                _ => Some(VarValue::Text(s.clone())),
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarValue::Number(n) => write!(f, "{n}"),
            VarValue::Text(s) => write!(f, "{s}"),
            VarValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Compare two values: numeric when both coerce to numbers, else by their
/// string/boolean forms.
pub fn compare(op: CompareOp, lhs: &VarValue, rhs: &VarValue) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Lt => a < b,
            CompareOp::Ge => a >= b,
            CompareOp::Le => a <= b,
        };
    }
    let a = lhs.to_string();
    let b = rhs.to_string();
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Gt => a > b,
        CompareOp::Lt => a < b,
        CompareOp::Ge => a >= b,
        CompareOp::Le => a <= b,
    }
}

/// Per-session variable store, seeded from the flow's declarations.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    declared: BTreeMap<String, VarType>,
    values: BTreeMap<String, VarValue>,
}

impl VariableStore {
    /// Seed from declarations, applying defaults.
    pub fn from_decls(decls: &[VariableDecl]) -> Self {
        let mut store = Self::default();
        for decl in decls {
            store.declared.insert(decl.id.clone(), decl.var_type);
            if let Some(default) = &decl.default {
                if let Some(value) = VarValue::from_json(Some(decl.var_type), default) {
                    store.values.insert(decl.id.clone(), value);
                }
            }
        }
        store
    }

    /// Supply a caller-provided global input.
    pub fn set_input(&mut self, id: &str, value: VarValue) -> Result<()> {
        self.set(id, value)
    }

    pub fn get(&self, id: &str) -> Option<&VarValue> {
        self.values.get(id)
    }

    pub fn set(&mut self, id: &str, value: VarValue) -> Result<()> {
        if !self.declared.contains_key(id) {
            return Err(EngineError::UnknownVariable(id.to_string()));
        }
        self.values.insert(id.to_string(), value);
        Ok(())
    }

    pub fn is_declared(&self, id: &str) -> bool {
        self.declared.contains_key(id)
    }

    /// Current values, for session snapshots.
    pub fn snapshot(&self) -> BTreeMap<String, VarValue> {
        self.values.clone()
    }

    /// Resolve a declared variable in a value context. No value is an
    /// error, never a silent zero.
    pub fn require(&self, block_id: &str, id: &str) -> Result<&VarValue> {
        self.values
            .get(id)
            .ok_or_else(|| EngineError::UnresolvedVariable {
                block_id: block_id.to_string(),
                variable: id.to_string(),
            })
    }

    /// Resolve a literal-or-variable number.
    pub fn resolve_number(&self, block_id: &str, value: &NumberOrVar) -> Result<f64> {
        if let Some(var_id) = value.variable_id() {
            let value = self.require(block_id, var_id)?;
            value
                .as_number()
                .ok_or_else(|| EngineError::UnresolvedVariable {
                    block_id: block_id.to_string(),
                    variable: var_id.to_string(),
                })
        } else {
            value
                .literal()
                .ok_or_else(|| EngineError::UnresolvedVariable {
                    block_id: block_id.to_string(),
                    variable: format!("{value:?}"),
                })
        }
    }

    /// Substitute `{{id}}` tokens in a log message. Tokens without a value
    /// are left verbatim; LOG never fails.
    pub fn interpolate(&self, message: &str) -> String {
        let mut out = String::with_capacity(message.len());
        let mut rest = message;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let tail = &rest[start + 2..];
            match tail.find("}}") {
                Some(end) => {
                    let token = tail[..end].trim();
                    match self.values.get(token) {
                        Some(value) => out.push_str(&value.to_string()),
                        None => {
                            out.push_str("{{");
                            out.push_str(&tail[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &tail[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = tail;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
