//! Core topology types: controllers, ports, relay boards, and devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Electrical kind of a controller port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Digital,
    Analog,
    Pwm,
}

/// What kind of entity owns a port or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortOwnerKind {
    Device,
    Relay,
}

impl std::fmt::Display for PortOwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortOwnerKind::Device => write!(f, "device"),
            PortOwnerKind::Relay => write!(f, "relay"),
        }
    }
}

/// Owner metadata recorded on an occupied port or channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOwner {
    pub kind: PortOwnerKind,
    pub id: String,
    pub name: String,
}

impl PortOwner {
    pub fn device(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PortOwnerKind::Device,
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn relay(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PortOwnerKind::Relay,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A single addressable physical line on a controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPort {
    /// Port id as printed on the board, e.g. `"D2"` or `"A0"`.
    pub id: String,
    pub kind: PortKind,
    /// Administratively enabled. Inactive ports can never be allocated.
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupied_by: Option<PortOwner>,
}

impl ControllerPort {
    pub fn new(id: impl Into<String>, kind: PortKind) -> Self {
        Self {
            id: id.into(),
            kind,
            is_active: true,
            occupied_by: None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied_by.is_some()
    }
}

fn default_true() -> bool {
    true
}

/// A serial/network microcontroller with a fixed set of ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controller {
    pub id: String,
    pub name: String,
    pub ports: Vec<ControllerPort>,
}

impl Controller {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ports: Vec::new(),
        }
    }

    pub fn find_port(&self, port_id: &str) -> Option<&ControllerPort> {
        self.ports.iter().find(|p| p.id == port_id)
    }

    pub fn find_port_mut(&mut self, port_id: &str) -> Option<&mut ControllerPort> {
        self.ports.iter_mut().find(|p| p.id == port_id)
    }
}

/// One actuation slot on a relay board, wired to a single controller port.
///
/// Occupancy here means "this channel", not "this wire" — the underlying
/// controller port is separately owned by the relay board itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChannel {
    pub index: u8,
    pub controller_port_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupied_by: Option<PortOwner>,
    /// Last commanded state of the channel.
    #[serde(default)]
    pub energized: bool,
}

impl RelayChannel {
    pub fn new(index: u8, controller_port_id: impl Into<String>) -> Self {
        Self {
            index,
            controller_port_id: controller_port_id.into(),
            occupied_by: None,
            energized: false,
        }
    }
}

/// A relay board hanging off one controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayBoard {
    pub id: String,
    pub name: String,
    pub controller_id: String,
    pub channels: Vec<RelayChannel>,
}

impl RelayBoard {
    pub fn find_channel(&self, index: u8) -> Option<&RelayChannel> {
        self.channels.iter().find(|c| c.index == index)
    }

    pub fn find_channel_mut(&mut self, index: u8) -> Option<&mut RelayChannel> {
        self.channels.iter_mut().find(|c| c.index == index)
    }
}

/// Hardware binding of a device: direct pins, or one relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeviceBinding {
    /// Directly wired to controller ports, one per template role.
    #[serde(rename_all = "camelCase")]
    Direct {
        controller_id: String,
        /// Template role -> controller port id.
        pins: BTreeMap<String, String>,
    },
    /// Switched through a relay channel.
    #[serde(rename_all = "camelCase")]
    Relay { relay_id: String, channel: u8 },
}

/// Per-device override of the template's hardware value range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Most recent vetted reading taken from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastReading {
    pub value: f64,
    pub raw: f64,
    pub timestamp: DateTime<Utc>,
}

/// A named, enabled/disabled binding of a device template to hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Template key this device instantiates.
    pub template_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub binding: DeviceBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_override: Option<ValueRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reading: Option<LastReading>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        template_type: impl Into<String>,
        binding: DeviceBinding,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            template_type: template_type.into(),
            enabled: true,
            binding,
            range_override: None,
            last_reading: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_serde_roundtrip() {
        let mut pins = BTreeMap::new();
        pins.insert("data".to_string(), "D4".to_string());
        let binding = DeviceBinding::Direct {
            controller_id: "ctrl-1".to_string(),
            pins,
        };

        let json = serde_json::to_string(&binding).unwrap();
        assert!(json.contains("\"kind\":\"direct\""));
        let restored: DeviceBinding = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, binding);
    }

    #[test]
    fn test_port_defaults_active_and_free() {
        let port: ControllerPort =
            serde_json::from_str(r#"{"id":"D2","kind":"digital"}"#).unwrap();
        assert!(port.is_active);
        assert!(!port.is_occupied());
    }
}
