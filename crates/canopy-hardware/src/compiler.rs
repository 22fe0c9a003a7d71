//! The command compiler: device + template -> concrete command payload.
//!
//! Pure and side-effect-free. It reads the template and the device's
//! already-resolved pin bindings; it never touches the topology store or a
//! transport.

use crate::catalog::{CatalogSnapshot, CommandDefinition, CommandParameter, ParamType};
use crate::error::CompileError;
use serde_json::Value;
use std::collections::BTreeMap;

/// The exact parameter set to send to a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPayload {
    pub command: String,
    pub params: BTreeMap<String, Value>,
    pub timeout_ms: u64,
}

/// Compile the command for a device.
///
/// `bound_pins` maps template port roles to controller port ids, as
/// resolved by the topology store. The algorithm:
///
/// 1. resolve the effective command name (`requiredCommand`, else
///    `executionConfig.commandType`)
/// 2. look up its parameter schema
/// 3. map each bound port role to a parameter name (`power` is physical
///    wiring, never a protocol parameter)
/// 4. parse each port token into the parameter's expected shape
/// 5. apply schema defaults for anything still unset
/// 6. overlay `executionConfig.parameters`, which always win
/// 7. verify every schema-required parameter is present
pub fn compile_command(
    catalog: &CatalogSnapshot,
    template: &crate::catalog::DeviceTemplate,
    device_id: &str,
    bound_pins: &BTreeMap<String, String>,
) -> Result<CommandPayload, CompileError> {
    let command_name = template
        .command_name()
        .ok_or_else(|| CompileError::NoCommand {
            device_id: device_id.to_string(),
        })?;
    let schema = catalog
        .command(command_name)
        .ok_or_else(|| CompileError::UnknownCommand {
            device_id: device_id.to_string(),
            command: command_name.to_string(),
        })?;

    let mut params: BTreeMap<String, Value> = BTreeMap::new();

    for requirement in &template.port_requirements {
        let Some(param_name) = role_parameter(&requirement.role, schema) else {
            continue;
        };
        let bound = bound_pins
            .get(&requirement.role)
            .or(requirement.default_pin.as_ref());
        let Some(port_id) = bound else {
            // An unbound required role surfaces below as a missing
            // required parameter, with the device named.
            continue;
        };
        let param_def = schema.find_parameter(&param_name);
        let value = parse_port_value(command_name, param_def, port_id).ok_or_else(|| {
            CompileError::InvalidPort {
                device_id: device_id.to_string(),
                port_id: port_id.clone(),
            }
        })?;
        params.insert(param_name, value);
    }

    for param in &schema.parameters {
        if !params.contains_key(&param.name) {
            if let Some(default) = &param.default {
                params.insert(param.name.clone(), default.clone());
            }
        }
    }

    for (key, value) in &template.execution_config.parameters {
        params.insert(key.clone(), value.clone());
    }

    let missing: Vec<String> = schema
        .parameters
        .iter()
        .filter(|p| p.required && !params.contains_key(&p.name))
        .map(|p| p.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(CompileError::MissingParameters {
            device_id: device_id.to_string(),
            command: command_name.to_string(),
            missing,
        });
    }

    Ok(CommandPayload {
        command: command_name.to_string(),
        params,
        timeout_ms: template.execution_config.timeout_ms,
    })
}

/// Fixed role -> parameter name table. Roles outside the table map to a
/// same-named schema parameter when one exists, else to `pin`.
fn role_parameter(role: &str, schema: &CommandDefinition) -> Option<String> {
    let name = match role {
        "trigger" => "triggerPin",
        "echo" => "echoPin",
        "control" => "pin",
        "rx" => "rxPin",
        "tx" => "txPin",
        "data" => {
            if schema.find_parameter("dataPin").is_some() {
                "dataPin"
            } else {
                "pin"
            }
        }
        // Power is physical wiring, never a protocol parameter.
        "power" => return None,
        other => {
            if schema.find_parameter(other).is_some() {
                other
            } else {
                "pin"
            }
        }
    };
    Some(name.to_string())
}

/// Parse a port token (`"D2"`, `"A0"`, `"7"`) into the parameter's shape.
///
/// A leading `D`/`A` followed by digits is stripped to an integer, except
/// when the command is `ANALOG` and the parameter is string-typed: analog
/// firmware addresses pins by their printed token, so `"A0"` is preserved
/// verbatim.
fn parse_port_value(
    command: &str,
    param_def: Option<&CommandParameter>,
    port_id: &str,
) -> Option<Value> {
    if command == "ANALOG" && param_def.map_or(false, |p| p.param_type == ParamType::String) {
        return Some(Value::String(port_id.to_string()));
    }
    let digits = port_id
        .strip_prefix(['D', 'A'])
        .unwrap_or(port_id);
    digits.parse::<u64>().ok().map(Value::from)
}

/// A dosing request: either an explicit volume, or a number of nominal
/// doses converted through the calibrated dose size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DoseRequest {
    VolumeMl(f64),
    Doses(f64),
}

const VOLUME_UNITS: [&str; 5] = ["ml", "mL", "l", "L", "liters"];

/// Compute the pump run duration for a dose.
///
/// `duration_ms = volume_ml / flow_rate_ml_per_s * 1000`. A display unit
/// outside the volume family is rejected rather than silently coerced.
pub fn dose_duration_ms(
    template: &crate::catalog::DeviceTemplate,
    device_id: &str,
    request: DoseRequest,
) -> Result<u64, CompileError> {
    if let Some(unit) = &template.display_unit {
        if !VOLUME_UNITS.contains(&unit.as_str()) {
            return Err(CompileError::UnitMismatch {
                device_id: device_id.to_string(),
                unit: unit.clone(),
            });
        }
    }
    let calibration =
        template
            .calibration
            .as_ref()
            .ok_or_else(|| CompileError::NoCalibration {
                device_id: device_id.to_string(),
                detail: "template has no calibration config".to_string(),
            })?;
    let flow_rate = calibration
        .flow_rate_ml_per_s
        .filter(|r| *r > 0.0)
        .ok_or_else(|| CompileError::NoCalibration {
            device_id: device_id.to_string(),
            detail: "calibration has no positive flow rate".to_string(),
        })?;
    let volume_ml = match request {
        DoseRequest::VolumeMl(v) => v,
        DoseRequest::Doses(n) => {
            let dose_size =
                calibration
                    .dose_size_ml
                    .filter(|d| *d > 0.0)
                    .ok_or_else(|| CompileError::NoCalibration {
                        device_id: device_id.to_string(),
                        detail: "calibration has no positive dose size".to_string(),
                    })?;
            n * dose_size
        }
    };
    Ok((volume_ml / flow_rate * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        CalibrationConfig, CatalogBuilder, DeviceTemplate, ExecutionConfig, PortRequirement,
    };
    use canopy_topology::PortKind;
    use serde_json::json;
    use std::sync::Arc;

    fn catalog() -> Arc<CatalogSnapshot> {
        CatalogBuilder::new().with_builtin_commands().build().unwrap()
    }

    fn template(command: &str, roles: &[(&str, PortKind)]) -> DeviceTemplate {
        DeviceTemplate {
            template_type: "test_template".to_string(),
            name: "Test".to_string(),
            physical_type: "other".to_string(),
            required_command: Some(command.to_string()),
            port_requirements: roles
                .iter()
                .map(|(role, kind)| PortRequirement::new(*role, *kind))
                .collect(),
            execution_config: ExecutionConfig::default(),
            calibration: None,
            hardware_range: None,
            display_unit: None,
            version: 1,
            active: true,
        }
    }

    fn pins(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_analog_string_pin_preserved_verbatim() {
        let tpl = template("ANALOG", &[("data", PortKind::Analog)]);
        let payload =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("data", "A0")])).unwrap();
        assert_eq!(payload.params["pin"], json!("A0"));
    }

    #[test]
    fn test_digital_prefix_stripped_to_integer() {
        let tpl = template("DIGITAL_READ", &[("data", PortKind::Digital)]);
        let payload =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("data", "D2")])).unwrap();
        assert_eq!(payload.params["pin"], json!(2));
    }

    #[test]
    fn test_role_table_maps_trigger_and_echo() {
        let tpl = template(
            "ULTRASONIC",
            &[("trigger", PortKind::Digital), ("echo", PortKind::Digital)],
        );
        let payload = compile_command(
            &catalog(),
            &tpl,
            "dev-1",
            &pins(&[("trigger", "D5"), ("echo", "D6")]),
        )
        .unwrap();
        assert_eq!(payload.params["triggerPin"], json!(5));
        assert_eq!(payload.params["echoPin"], json!(6));
    }

    #[test]
    fn test_power_role_is_never_a_parameter() {
        let mut tpl = template(
            "DIGITAL_READ",
            &[("data", PortKind::Digital), ("power", PortKind::Digital)],
        );
        tpl.port_requirements[1].required = false;
        let payload = compile_command(
            &catalog(),
            &tpl,
            "dev-1",
            &pins(&[("data", "D2"), ("power", "D7")]),
        )
        .unwrap();
        assert_eq!(payload.params.len(), 1);
        assert!(payload.params.contains_key("pin"));
    }

    #[test]
    fn test_missing_required_parameter_is_a_named_error() {
        let tpl = template("SET_PIN", &[("control", PortKind::Digital)]);
        // control binds pin, but SET_PIN also requires state and nothing
        // supplies it.
        let err = compile_command(&catalog(), &tpl, "pump-3", &pins(&[("control", "D8")]))
            .unwrap_err();
        match err {
            CompileError::MissingParameters {
                device_id,
                command,
                missing,
            } => {
                assert_eq!(device_id, "pump-3");
                assert_eq!(command, "SET_PIN");
                assert_eq!(missing, vec!["state".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_execution_config_parameters_always_win() {
        let mut tpl = template("SET_PIN", &[("control", PortKind::Digital)]);
        tpl.execution_config.parameters = json!({"state": 1, "pin": 12})
            .as_object()
            .cloned()
            .unwrap();
        let payload =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("control", "D8")])).unwrap();
        // The template overlay beats the computed pin.
        assert_eq!(payload.params["pin"], json!(12));
        assert_eq!(payload.params["state"], json!(1));
    }

    #[test]
    fn test_schema_defaults_fill_unset_parameters() {
        let tpl = template("PWM_SET", &[("control", PortKind::Pwm)]);
        let payload =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("control", "D9")])).unwrap();
        assert_eq!(payload.params["duty"], json!(0));
    }

    #[test]
    fn test_default_pin_used_when_role_unbound() {
        let mut tpl = template("DIGITAL_READ", &[("data", PortKind::Digital)]);
        tpl.port_requirements[0].default_pin = Some("D4".to_string());
        let payload = compile_command(&catalog(), &tpl, "dev-1", &BTreeMap::new()).unwrap();
        assert_eq!(payload.params["pin"], json!(4));
    }

    #[test]
    fn test_unknown_command_and_no_command() {
        let tpl = template("FROBNICATE", &[("data", PortKind::Digital)]);
        let err =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("data", "D2")])).unwrap_err();
        assert!(matches!(err, CompileError::UnknownCommand { .. }));

        let mut tpl = template("ANALOG", &[("data", PortKind::Analog)]);
        tpl.required_command = None;
        let err =
            compile_command(&catalog(), &tpl, "dev-1", &pins(&[("data", "A0")])).unwrap_err();
        assert!(matches!(err, CompileError::NoCommand { .. }));
    }

    #[test]
    fn test_garbage_port_token_rejected() {
        let tpl = template("DIGITAL_READ", &[("data", PortKind::Digital)]);
        let err = compile_command(&catalog(), &tpl, "dev-1", &pins(&[("data", "Dx9")]))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidPort { .. }));
    }

    #[test]
    fn test_dose_duration_from_volume_and_doses() {
        let mut tpl = template("SET_PIN", &[("control", PortKind::Digital)]);
        tpl.display_unit = Some("ml".to_string());
        tpl.calibration = Some(CalibrationConfig {
            flow_rate_ml_per_s: Some(1.0),
            dose_size_ml: Some(5.0),
            ..Default::default()
        });

        // 2 doses x 5 ml at 1 ml/s = 10 s
        assert_eq!(
            dose_duration_ms(&tpl, "pump-1", DoseRequest::Doses(2.0)).unwrap(),
            10_000
        );
        assert_eq!(
            dose_duration_ms(&tpl, "pump-1", DoseRequest::VolumeMl(2.5)).unwrap(),
            2500
        );
    }

    #[test]
    fn test_dose_rejects_non_volume_display_unit() {
        let mut tpl = template("SET_PIN", &[("control", PortKind::Digital)]);
        tpl.display_unit = Some("count".to_string());
        tpl.calibration = Some(CalibrationConfig {
            flow_rate_ml_per_s: Some(1.0),
            ..Default::default()
        });
        let err = dose_duration_ms(&tpl, "pump-1", DoseRequest::VolumeMl(5.0)).unwrap_err();
        assert!(matches!(err, CompileError::UnitMismatch { .. }));
    }

    #[test]
    fn test_dose_requires_calibration() {
        let tpl = template("SET_PIN", &[("control", PortKind::Digital)]);
        let err = dose_duration_ms(&tpl, "pump-1", DoseRequest::Doses(1.0)).unwrap_err();
        assert!(matches!(err, CompileError::NoCalibration { .. }));
    }
}
