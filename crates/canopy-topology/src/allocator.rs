//! The topology store: the only writer of port and channel occupancy.
//!
//! Every allocation runs check-then-reserve as one critical section per
//! controller (or per relay), so two requests can never both observe the
//! same port as free. Different controllers are independent locks and may
//! be allocated in parallel.

use crate::error::{Result, TopologyError};
use crate::types::{
    Controller, Device, DeviceBinding, LastReading, PortOwner, RelayBoard,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A device binding resolved down to concrete controller ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    pub controller_id: String,
    /// Template role -> controller port id. Relay-bound devices resolve to
    /// a single `control` role pointing at the channel's wire.
    pub pins: BTreeMap<String, String>,
    /// Set when the device is switched through a relay channel.
    pub relay: Option<(String, u8)>,
}

/// Thread-safe registry of controllers, relay boards, and devices.
#[derive(Default)]
pub struct TopologyStore {
    controllers: RwLock<HashMap<String, Arc<Mutex<Controller>>>>,
    relays: RwLock<HashMap<String, Arc<Mutex<RelayBoard>>>>,
    devices: RwLock<HashMap<String, Device>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Controllers
    // =========================================================================

    /// Register or replace a controller. Occupancy on the incoming record is
    /// taken as-is; callers normally register controllers with free ports.
    pub fn insert_controller(&self, controller: Controller) {
        log::info!(
            "Registered controller '{}' with {} ports",
            controller.id,
            controller.ports.len()
        );
        self.controllers
            .write()
            .insert(controller.id.clone(), Arc::new(Mutex::new(controller)));
    }

    /// Snapshot of a controller's current state.
    pub fn controller(&self, id: &str) -> Result<Controller> {
        let handle = self.controller_handle(id)?;
        let guard = handle.lock();
        Ok(guard.clone())
    }

    fn controller_handle(&self, id: &str) -> Result<Arc<Mutex<Controller>>> {
        self.controllers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownController(id.to_string()))
    }

    /// Allocate a set of controller ports to one owner, atomically.
    ///
    /// Every requested port must exist, be active, and be either free or
    /// already owned by the same entity. On success, ports the entity
    /// previously owned on this controller but no longer requests are freed.
    /// On any conflict nothing is applied.
    pub fn allocate_ports(
        &self,
        owner: &PortOwner,
        controller_id: &str,
        requested: &[String],
    ) -> Result<()> {
        let handle = self.controller_handle(controller_id)?;
        let mut controller = handle.lock();

        // Verify first; reserve only once every port checks out.
        for port_id in requested {
            let port = controller.find_port(port_id).ok_or_else(|| {
                TopologyError::UnknownPort {
                    controller_id: controller_id.to_string(),
                    port_id: port_id.clone(),
                }
            })?;
            if !port.is_active {
                return Err(TopologyError::InactivePort {
                    controller_id: controller_id.to_string(),
                    port_id: port_id.clone(),
                });
            }
            if let Some(current) = &port.occupied_by {
                if current.id != owner.id {
                    return Err(TopologyError::PortConflict {
                        controller_id: controller_id.to_string(),
                        port_id: port_id.clone(),
                        owner_kind: current.kind.to_string(),
                        owner_name: current.name.clone(),
                    });
                }
            }
        }

        for port in controller.ports.iter_mut() {
            let wanted = requested.iter().any(|r| r == &port.id);
            let mine = port
                .occupied_by
                .as_ref()
                .map_or(false, |o| o.id == owner.id);
            if wanted {
                port.occupied_by = Some(owner.clone());
            } else if mine {
                log::debug!(
                    "Freeing port {} on {} no longer used by '{}'",
                    port.id,
                    controller_id,
                    owner.name
                );
                port.occupied_by = None;
            }
        }
        log::info!(
            "Allocated {:?} on controller {} to {} '{}'",
            requested,
            controller_id,
            owner.kind,
            owner.name
        );
        Ok(())
    }

    // =========================================================================
    // Relay boards
    // =========================================================================

    /// Register a relay board, claiming its controller ports.
    ///
    /// The board itself becomes the owner of every port its channels are
    /// wired to. A conflict on any wire rejects the whole board.
    pub fn insert_relay(&self, relay: RelayBoard) -> Result<()> {
        let owner = PortOwner::relay(&relay.id, &relay.name);
        let wires: Vec<String> = relay
            .channels
            .iter()
            .map(|c| c.controller_port_id.clone())
            .collect();
        self.allocate_ports(&owner, &relay.controller_id, &wires)?;
        log::info!(
            "Registered relay '{}' ({} channels) on controller {}",
            relay.id,
            relay.channels.len(),
            relay.controller_id
        );
        self.relays
            .write()
            .insert(relay.id.clone(), Arc::new(Mutex::new(relay)));
        Ok(())
    }

    /// Remove a relay board, freeing its controller ports unconditionally.
    pub fn remove_relay(&self, relay_id: &str) -> Result<RelayBoard> {
        let handle = self
            .relays
            .write()
            .remove(relay_id)
            .ok_or_else(|| TopologyError::UnknownRelay(relay_id.to_string()))?;
        let relay = handle.lock().clone();
        self.free_ports_owned_by(relay_id);
        Ok(relay)
    }

    fn relay_handle(&self, id: &str) -> Result<Arc<Mutex<RelayBoard>>> {
        self.relays
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownRelay(id.to_string()))
    }

    /// Snapshot of a relay board's current state.
    pub fn relay(&self, id: &str) -> Result<RelayBoard> {
        let handle = self.relay_handle(id)?;
        let guard = handle.lock();
        Ok(guard.clone())
    }

    /// Allocate one relay channel to an owner, freeing any other channel the
    /// owner held on the same board. Single critical section per relay.
    pub fn allocate_channel(&self, owner: &PortOwner, relay_id: &str, channel: u8) -> Result<()> {
        let handle = self.relay_handle(relay_id)?;
        let mut relay = handle.lock();

        let slot = relay
            .find_channel(channel)
            .ok_or(TopologyError::UnknownChannel {
                relay_id: relay_id.to_string(),
                channel,
            })?;
        if let Some(current) = &slot.occupied_by {
            if current.id != owner.id {
                return Err(TopologyError::ChannelConflict {
                    relay_id: relay_id.to_string(),
                    channel,
                    owner_name: current.name.clone(),
                });
            }
        }

        for slot in relay.channels.iter_mut() {
            let mine = slot
                .occupied_by
                .as_ref()
                .map_or(false, |o| o.id == owner.id);
            if slot.index == channel {
                slot.occupied_by = Some(owner.clone());
            } else if mine {
                slot.occupied_by = None;
            }
        }
        log::info!(
            "Allocated channel {} on relay {} to '{}'",
            channel,
            relay_id,
            owner.name
        );
        Ok(())
    }

    /// Record the last commanded state of a relay channel.
    pub fn set_channel_state(&self, relay_id: &str, channel: u8, energized: bool) -> Result<()> {
        let handle = self.relay_handle(relay_id)?;
        let mut relay = handle.lock();
        let slot = relay
            .find_channel_mut(channel)
            .ok_or(TopologyError::UnknownChannel {
                relay_id: relay_id.to_string(),
                channel,
            })?;
        slot.energized = energized;
        Ok(())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Insert or update a device, reserving the hardware its binding names.
    ///
    /// Allocation of the new binding happens first; only then are lines the
    /// device held elsewhere (a previous binding on another controller or
    /// relay) swept and freed. Disabled devices hold no hardware.
    pub fn upsert_device(&self, device: Device) -> Result<()> {
        if device.enabled {
            let owner = PortOwner::device(&device.id, &device.name);
            match &device.binding {
                DeviceBinding::Direct {
                    controller_id,
                    pins,
                } => {
                    let requested: Vec<String> = pins.values().cloned().collect();
                    self.allocate_ports(&owner, controller_id, &requested)?;
                    self.free_ports_owned_by_except(&device.id, Some(controller_id));
                    self.free_channels_owned_by_except(&device.id, None);
                }
                DeviceBinding::Relay { relay_id, channel } => {
                    self.allocate_channel(&owner, relay_id, *channel)?;
                    self.free_ports_owned_by_except(&device.id, None);
                    self.free_channels_owned_by_except(&device.id, Some(relay_id));
                }
            }
        } else {
            self.free_ports_owned_by(&device.id);
            self.free_channels_owned_by(&device.id);
        }
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    /// Remove a device, freeing everything it owned.
    pub fn remove_device(&self, device_id: &str) -> Result<Device> {
        let device = self
            .devices
            .write()
            .remove(device_id)
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.to_string()))?;
        self.free_ports_owned_by(device_id);
        self.free_channels_owned_by(device_id);
        log::info!("Removed device '{}' and freed its hardware", device_id);
        Ok(device)
    }

    /// Enable or disable a device. Disabling frees its hardware; enabling
    /// re-allocates the stored binding (and may conflict).
    pub fn set_device_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        let mut device = self.device(device_id)?;
        device.enabled = enabled;
        self.upsert_device(device)
    }

    /// Snapshot of a device record.
    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.to_string()))
    }

    /// Resolve a device's binding down to a controller and concrete ports.
    ///
    /// Relay-bound devices resolve through the channel's wire to the relay's
    /// controller, exposing a single `control` role.
    pub fn resolve_binding(&self, device_id: &str) -> Result<ResolvedBinding> {
        let device = self.device(device_id)?;
        if !device.enabled {
            return Err(TopologyError::DeviceDisabled(device_id.to_string()));
        }
        match &device.binding {
            DeviceBinding::Direct {
                controller_id,
                pins,
            } => Ok(ResolvedBinding {
                controller_id: controller_id.clone(),
                pins: pins.clone(),
                relay: None,
            }),
            DeviceBinding::Relay { relay_id, channel } => {
                let relay = self.relay(relay_id)?;
                let slot = relay
                    .find_channel(*channel)
                    .ok_or(TopologyError::UnknownChannel {
                        relay_id: relay_id.clone(),
                        channel: *channel,
                    })?;
                let mut pins = BTreeMap::new();
                pins.insert("control".to_string(), slot.controller_port_id.clone());
                Ok(ResolvedBinding {
                    controller_id: relay.controller_id.clone(),
                    pins,
                    relay: Some((relay_id.clone(), *channel)),
                })
            }
        }
    }

    /// Store the latest vetted reading on a device record.
    pub fn record_reading(&self, device_id: &str, value: f64, raw: f64) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.to_string()))?;
        device.last_reading = Some(LastReading {
            value,
            raw,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    fn free_ports_owned_by(&self, entity_id: &str) {
        self.free_ports_owned_by_except(entity_id, None)
    }

    fn free_ports_owned_by_except(&self, entity_id: &str, keep_controller: Option<&str>) {
        let handles: Vec<Arc<Mutex<Controller>>> = self
            .controllers
            .read()
            .iter()
            .filter(|(id, _)| keep_controller != Some(id.as_str()))
            .map(|(_, h)| h.clone())
            .collect();
        for handle in handles {
            let mut controller = handle.lock();
            for port in controller.ports.iter_mut() {
                if port
                    .occupied_by
                    .as_ref()
                    .map_or(false, |o| o.id == entity_id)
                {
                    port.occupied_by = None;
                }
            }
        }
    }

    fn free_channels_owned_by(&self, entity_id: &str) {
        self.free_channels_owned_by_except(entity_id, None)
    }

    fn free_channels_owned_by_except(&self, entity_id: &str, keep_relay: Option<&str>) {
        let handles: Vec<Arc<Mutex<RelayBoard>>> = self
            .relays
            .read()
            .iter()
            .filter(|(id, _)| keep_relay != Some(id.as_str()))
            .map(|(_, h)| h.clone())
            .collect();
        for handle in handles {
            let mut relay = handle.lock();
            for slot in relay.channels.iter_mut() {
                if slot
                    .occupied_by
                    .as_ref()
                    .map_or(false, |o| o.id == entity_id)
                {
                    slot.occupied_by = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ControllerPort, PortKind, RelayChannel};

    fn test_controller(id: &str) -> Controller {
        let mut ctrl = Controller::new(id, format!("Controller {id}"));
        ctrl.ports = vec![
            ControllerPort::new("D2", PortKind::Digital),
            ControllerPort::new("D3", PortKind::Digital),
            ControllerPort::new("D4", PortKind::Digital),
            ControllerPort::new("A0", PortKind::Analog),
        ];
        ctrl
    }

    fn direct_device(id: &str, controller: &str, role: &str, pin: &str) -> Device {
        let mut pins = BTreeMap::new();
        pins.insert(role.to_string(), pin.to_string());
        Device::new(
            id,
            format!("Device {id}"),
            "generic_sensor",
            DeviceBinding::Direct {
                controller_id: controller.to_string(),
                pins,
            },
        )
    }

    #[test]
    fn test_allocation_is_mutually_exclusive() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));

        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap();

        // A different entity wanting the same pin must conflict.
        let err = store
            .upsert_device(direct_device("dev-b", "ctrl-1", "data", "D2"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::PortConflict { .. }));

        // The same entity re-assigning its own pin is an update, not a conflict.
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap();
    }

    #[test]
    fn test_reassignment_frees_old_ports() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));

        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap();
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D3"))
            .unwrap();

        let ctrl = store.controller("ctrl-1").unwrap();
        assert!(!ctrl.find_port("D2").unwrap().is_occupied());
        assert!(ctrl.find_port("D3").unwrap().is_occupied());

        // D2 is free again for another device.
        store
            .upsert_device(direct_device("dev-b", "ctrl-1", "data", "D2"))
            .unwrap();
    }

    #[test]
    fn test_delete_frees_everything() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D4"))
            .unwrap();

        store.remove_device("dev-a").unwrap();
        let ctrl = store.controller("ctrl-1").unwrap();
        assert!(!ctrl.find_port("D4").unwrap().is_occupied());
    }

    #[test]
    fn test_disable_frees_and_enable_reclaims() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap();

        store.set_device_enabled("dev-a", false).unwrap();
        assert!(!store
            .controller("ctrl-1")
            .unwrap()
            .find_port("D2")
            .unwrap()
            .is_occupied());

        store.set_device_enabled("dev-a", true).unwrap();
        assert!(store
            .controller("ctrl-1")
            .unwrap()
            .find_port("D2")
            .unwrap()
            .is_occupied());
    }

    #[test]
    fn test_inactive_port_rejected() {
        let store = TopologyStore::new();
        let mut ctrl = test_controller("ctrl-1");
        ctrl.find_port_mut("D2").unwrap().is_active = false;
        store.insert_controller(ctrl);

        let err = store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::InactivePort { .. }));
    }

    #[test]
    fn test_conflict_applies_nothing() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D3"))
            .unwrap();

        // dev-b wants D2 (free) and D3 (taken): the whole request fails and
        // D2 stays free.
        let mut pins = BTreeMap::new();
        pins.insert("trigger".to_string(), "D2".to_string());
        pins.insert("echo".to_string(), "D3".to_string());
        let dev_b = Device::new(
            "dev-b",
            "Device dev-b",
            "ultrasonic",
            DeviceBinding::Direct {
                controller_id: "ctrl-1".to_string(),
                pins,
            },
        );
        assert!(store.upsert_device(dev_b).is_err());
        let ctrl = store.controller("ctrl-1").unwrap();
        assert!(!ctrl.find_port("D2").unwrap().is_occupied());
    }

    #[test]
    fn test_relay_claims_wires_and_channels_allocate() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));

        let relay = RelayBoard {
            id: "relay-1".to_string(),
            name: "Relay 1".to_string(),
            controller_id: "ctrl-1".to_string(),
            channels: vec![RelayChannel::new(0, "D2"), RelayChannel::new(1, "D3")],
        };
        store.insert_relay(relay).unwrap();

        // The board owns the wires now; a direct device cannot take D2.
        let err = store
            .upsert_device(direct_device("dev-x", "ctrl-1", "data", "D2"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::PortConflict { .. }));

        // A pump on channel 0 resolves through the relay to D2.
        let pump = Device::new(
            "pump-1",
            "Dosing pump",
            "peristaltic_pump",
            DeviceBinding::Relay {
                relay_id: "relay-1".to_string(),
                channel: 0,
            },
        );
        store.upsert_device(pump).unwrap();
        let resolved = store.resolve_binding("pump-1").unwrap();
        assert_eq!(resolved.controller_id, "ctrl-1");
        assert_eq!(resolved.pins.get("control").map(String::as_str), Some("D2"));
        assert_eq!(resolved.relay, Some(("relay-1".to_string(), 0)));

        // Channel exclusivity.
        let pump2 = Device::new(
            "pump-2",
            "Second pump",
            "peristaltic_pump",
            DeviceBinding::Relay {
                relay_id: "relay-1".to_string(),
                channel: 0,
            },
        );
        let err = store.upsert_device(pump2).unwrap_err();
        assert!(matches!(err, TopologyError::ChannelConflict { .. }));
    }

    #[test]
    fn test_remove_relay_frees_wires() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        let relay = RelayBoard {
            id: "relay-1".to_string(),
            name: "Relay 1".to_string(),
            controller_id: "ctrl-1".to_string(),
            channels: vec![RelayChannel::new(0, "D2")],
        };
        store.insert_relay(relay).unwrap();
        store.remove_relay("relay-1").unwrap();

        let ctrl = store.controller("ctrl-1").unwrap();
        assert!(!ctrl.find_port("D2").unwrap().is_occupied());
    }

    #[test]
    fn test_disabled_device_does_not_resolve() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "D2"))
            .unwrap();
        store.set_device_enabled("dev-a", false).unwrap();

        let err = store.resolve_binding("dev-a").unwrap_err();
        assert!(matches!(err, TopologyError::DeviceDisabled(_)));
    }

    #[test]
    fn test_record_reading() {
        let store = TopologyStore::new();
        store.insert_controller(test_controller("ctrl-1"));
        store
            .upsert_device(direct_device("dev-a", "ctrl-1", "data", "A0"))
            .unwrap();

        store.record_reading("dev-a", 6.8, 412.0).unwrap();
        let device = store.device("dev-a").unwrap();
        let reading = device.last_reading.unwrap();
        assert_eq!(reading.value, 6.8);
        assert_eq!(reading.raw, 412.0);
    }
}
