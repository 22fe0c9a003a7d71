//! The capability catalog: command definitions and device templates.
//!
//! A catalog is built once, validated, and shared as an immutable
//! [`CatalogSnapshot`]. Refreshing the catalog produces a new snapshot;
//! sessions keep reading the one they were started with.

use crate::error::CatalogError;
use canopy_topology::{PortKind, ValueRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Wire type of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Number,
    String,
    Boolean,
}

/// One parameter in a command's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl CommandParameter {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A command a controller understands, with its parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Vec<CommandParameter>,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, parameters: Vec<CommandParameter>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters,
        }
    }

    pub fn find_parameter(&self, name: &str) -> Option<&CommandParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// How a template's command(s) are executed on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    SingleCommand,
    MultiStep,
    ArduinoNative,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::SingleCommand
    }
}

/// Where to find the value in a controller response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_method: Option<String>,
}

/// Execution behavior declared on a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    /// Template-level parameter overrides; always win over computed values.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<ResponseMapping>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_sequence: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    5000
}

/// One physical line a device class needs, by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRequirement {
    pub role: String,
    #[serde(rename = "type")]
    pub kind: PortKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pin: Option<String>,
}

fn default_required() -> bool {
    true
}

impl PortRequirement {
    pub fn new(role: impl Into<String>, kind: PortKind) -> Self {
        Self {
            role: role.into(),
            kind,
            required: true,
            default_pin: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default_pin(mut self, pin: impl Into<String>) -> Self {
        self.default_pin = Some(pin.into());
        self
    }
}

/// Calibration data for converting between raw readings, engineering
/// values, and dosing behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationConfig {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub points: Vec<CalibrationPoint>,
    /// Pump throughput, for DOSE duration computation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_rate_ml_per_s: Option<f64>,
    /// Volume delivered by one nominal dose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_size_ml: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationPoint {
    pub raw: f64,
    pub value: f64,
}

/// Static description of a hardware device class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTemplate {
    /// Unique template key, e.g. `"dfrobot_ph_pro"`.
    #[serde(rename = "type")]
    pub template_type: String,
    pub name: String,
    /// Sensor/actuator kind, e.g. `"ph"`, `"temp"`, `"pump"`.
    pub physical_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_command: Option<String>,
    pub port_requirements: Vec<PortRequirement>,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationConfig>,
    /// Hardware measurement limits for range validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_range: Option<ValueRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_unit: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Soft-deactivation flag; inactive templates stay resolvable for
    /// existing devices but are hidden from new ones.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl DeviceTemplate {
    /// Effective command name: `requiredCommand` wins, then
    /// `executionConfig.commandType`.
    pub fn command_name(&self) -> Option<&str> {
        self.required_command
            .as_deref()
            .or(self.execution_config.command_type.as_deref())
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.port_requirements.is_empty() {
            return Err(CatalogError::NoPortRequirements(self.template_type.clone()));
        }
        let multi = self.execution_config.strategy == ExecutionStrategy::MultiStep;
        if multi != !self.execution_config.command_sequence.is_empty() {
            return Err(CatalogError::CommandSequenceMismatch(
                self.template_type.clone(),
            ));
        }
        Ok(())
    }
}

/// Immutable, validated view of all known commands and templates.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    commands: HashMap<String, CommandDefinition>,
    templates: HashMap<String, DeviceTemplate>,
}

impl CatalogSnapshot {
    pub fn command(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.get(name)
    }

    pub fn template(&self, template_type: &str) -> Option<&DeviceTemplate> {
        self.templates.get(template_type)
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    pub fn template_types(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}

/// Builder for catalog snapshots.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    commands: Vec<CommandDefinition>,
    templates: Vec<DeviceTemplate>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder with the controller firmware's built-in command set.
    pub fn with_builtin_commands(mut self) -> Self {
        self.commands.extend(builtin_commands());
        self
    }

    pub fn command(mut self, command: CommandDefinition) -> Self {
        self.commands.push(command);
        self
    }

    pub fn template(mut self, template: DeviceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Validate everything and freeze the snapshot.
    pub fn build(self) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        let mut snapshot = CatalogSnapshot::default();
        for command in self.commands {
            if snapshot.commands.contains_key(&command.name) {
                return Err(CatalogError::DuplicateCommand(command.name));
            }
            snapshot.commands.insert(command.name.clone(), command);
        }
        for template in self.templates {
            template.validate()?;
            if snapshot.templates.contains_key(&template.template_type) {
                return Err(CatalogError::DuplicateTemplate(template.template_type));
            }
            snapshot
                .templates
                .insert(template.template_type.clone(), template);
        }
        log::info!(
            "Built catalog snapshot: {} commands, {} templates",
            snapshot.commands.len(),
            snapshot.templates.len()
        );
        Ok(Arc::new(snapshot))
    }
}

/// Commands every supported controller firmware ships with.
fn builtin_commands() -> Vec<CommandDefinition> {
    use serde_json::json;
    vec![
        // ANALOG keeps its pin as a string so "A0"-style tokens survive.
        CommandDefinition::new(
            "ANALOG",
            vec![CommandParameter::required("pin", ParamType::String)],
        ),
        CommandDefinition::new(
            "DIGITAL_READ",
            vec![CommandParameter::required("pin", ParamType::Number)],
        ),
        CommandDefinition::new(
            "SET_PIN",
            vec![
                CommandParameter::required("pin", ParamType::Number),
                CommandParameter::required("state", ParamType::Number),
            ],
        ),
        CommandDefinition::new(
            "PWM_SET",
            vec![
                CommandParameter::required("pin", ParamType::Number),
                CommandParameter::optional("duty", ParamType::Number).with_default(json!(0)),
            ],
        ),
        CommandDefinition::new(
            "ULTRASONIC",
            vec![
                CommandParameter::required("triggerPin", ParamType::Number),
                CommandParameter::required("echoPin", ParamType::Number),
            ],
        ),
        CommandDefinition::new(
            "ONEWIRE",
            vec![CommandParameter::required("pin", ParamType::Number)],
        ),
    ]
}
