//! The engine-facing hardware bridge.
//!
//! [`CanopyBridge`] is the one place where a flow block's device id turns
//! into real I/O: resolve the binding, look up the template, compile the
//! command, and push it through the dispatcher or the sampling pipeline.
//! The engine only ever sees [`BridgeError`] kinds, which decide whether
//! its block-level retry policy applies.

use async_trait::async_trait;
use canopy_hardware::compiler::{compile_command, dose_duration_ms, CommandPayload, DoseRequest};
use canopy_hardware::sampling::{effective_range, ReadOutcome, SamplingConfig, SamplingPipeline};
use canopy_hardware::transport::{CommandDispatcher, Transport};
use canopy_hardware::{CatalogSnapshot, CompileError, DeviceTemplate, ReadError};
use canopy_topology::{Device, ResolvedBinding, TopologyStore};
use flow_engine::{ActuatorState, BridgeError, BridgeErrorKind, DoseSpec, HardwareBridge, SensorReading};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Production [`HardwareBridge`]: topology + catalog + compiler + transport.
pub struct CanopyBridge {
    topology: Arc<TopologyStore>,
    catalog: Arc<CatalogSnapshot>,
    dispatcher: Arc<CommandDispatcher>,
    pipeline: SamplingPipeline,
    default_sampling: SamplingConfig,
    /// Per-device sampling overrides, keyed by device id.
    sampling_overrides: Mutex<HashMap<String, SamplingConfig>>,
}

impl CanopyBridge {
    pub fn new(
        topology: Arc<TopologyStore>,
        catalog: Arc<CatalogSnapshot>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new(transport));
        Self {
            topology,
            catalog,
            pipeline: SamplingPipeline::new(dispatcher.clone()),
            dispatcher,
            default_sampling: SamplingConfig::default(),
            sampling_overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_sampling(mut self, cfg: SamplingConfig) -> Self {
        self.default_sampling = cfg;
        self
    }

    /// Install a per-device sampling policy, replacing any previous one.
    pub fn set_sampling_config(&self, device_id: &str, cfg: SamplingConfig) {
        self.sampling_overrides
            .lock()
            .insert(device_id.to_string(), cfg);
    }

    fn sampling_config(&self, device_id: &str) -> SamplingConfig {
        self.sampling_overrides
            .lock()
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| self.default_sampling.clone())
    }

    /// Resolve everything a command needs: the device record, its concrete
    /// pins, and its template.
    fn device_context(
        &self,
        device_id: &str,
    ) -> Result<(Device, ResolvedBinding, &DeviceTemplate), BridgeError> {
        let device = self.topology.device(device_id).map_err(topology_error)?;
        let binding = self
            .topology
            .resolve_binding(device_id)
            .map_err(topology_error)?;
        let template = self
            .catalog
            .template(&device.template_type)
            .ok_or_else(|| {
                BridgeError::new(
                    BridgeErrorKind::Topology,
                    format!(
                        "device '{}' uses unknown template '{}'",
                        device_id, device.template_type
                    ),
                )
            })?;
        Ok((device, binding, template))
    }

    fn compile(
        &self,
        template: &DeviceTemplate,
        device_id: &str,
        binding: &ResolvedBinding,
    ) -> Result<CommandPayload, BridgeError> {
        compile_command(&self.catalog, template, device_id, &binding.pins).map_err(compile_error)
    }
}

#[async_trait]
impl HardwareBridge for CanopyBridge {
    async fn read_sensor(&self, device_id: &str) -> Result<SensorReading, BridgeError> {
        let (device, binding, template) = self.device_context(device_id)?;
        let payload = self.compile(template, device_id, &binding)?;

        let range = effective_range(template.hardware_range, device.range_override);
        let value_key = template
            .execution_config
            .response_mapping
            .as_ref()
            .and_then(|m| m.value_key.as_deref());
        let cfg = self.sampling_config(device_id);

        let outcome = self
            .pipeline
            .read(
                device_id,
                &binding.controller_id,
                &payload,
                value_key,
                range,
                &cfg,
            )
            .await
            .map_err(read_error)?;

        match outcome {
            ReadOutcome::Value(value) => {
                if let Err(e) = self.topology.record_reading(device_id, value, value) {
                    log::warn!("Could not record reading for '{device_id}': {e}");
                }
                Ok(SensorReading::Value(value))
            }
            ReadOutcome::Skipped => Ok(SensorReading::Skipped),
        }
    }

    async fn set_actuator(
        &self,
        device_id: &str,
        state: ActuatorState,
    ) -> Result<(), BridgeError> {
        let (_device, binding, template) = self.device_context(device_id)?;
        let mut payload = self.compile(template, device_id, &binding)?;
        // The compiled payload carries the template's resting state; the
        // block decides the actual level.
        let level = match state {
            ActuatorState::On => 1,
            ActuatorState::Off => 0,
        };
        payload
            .params
            .insert("state".to_string(), serde_json::json!(level));

        self.dispatcher
            .dispatch(&binding.controller_id, &payload)
            .await
            .map_err(|e| BridgeError::new(BridgeErrorKind::Transport, e.to_string()))?;

        if let Some((relay_id, channel)) = &binding.relay {
            let energized = state == ActuatorState::On;
            if let Err(e) = self
                .topology
                .set_channel_state(relay_id, *channel, energized)
            {
                log::warn!("Could not record channel state for '{device_id}': {e}");
            }
        }
        log::info!("Actuator '{device_id}' set {state:?}");
        Ok(())
    }

    async fn dose_duration_ms(
        &self,
        device_id: &str,
        spec: DoseSpec,
    ) -> Result<u64, BridgeError> {
        let device = self.topology.device(device_id).map_err(topology_error)?;
        let template = self
            .catalog
            .template(&device.template_type)
            .ok_or_else(|| {
                BridgeError::new(
                    BridgeErrorKind::Topology,
                    format!(
                        "device '{}' uses unknown template '{}'",
                        device_id, device.template_type
                    ),
                )
            })?;
        let request = match spec {
            DoseSpec::VolumeMl(v) => DoseRequest::VolumeMl(v),
            DoseSpec::Doses(n) => DoseRequest::Doses(n),
        };
        dose_duration_ms(template, device_id, request).map_err(compile_error)
    }
}

fn topology_error(e: canopy_topology::TopologyError) -> BridgeError {
    BridgeError::new(BridgeErrorKind::Topology, e.to_string())
}

fn compile_error(e: CompileError) -> BridgeError {
    BridgeError::new(BridgeErrorKind::Compile, e.to_string())
}

fn read_error(e: ReadError) -> BridgeError {
    let kind = match &e {
        ReadError::Transport(_) => BridgeErrorKind::Transport,
        ReadError::OutOfRange { .. } | ReadError::NonNumeric { .. } => BridgeErrorKind::Validation,
        ReadError::StaleSensor { .. } | ReadError::NoLastValid { .. } | ReadError::NoDefault { .. } => {
            BridgeErrorKind::Stale
        }
    };
    BridgeError::new(kind, e.to_string())
}
