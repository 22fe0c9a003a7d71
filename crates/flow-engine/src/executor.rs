//! The flow interpreter.
//!
//! Walks a [`CompiledFlow`] one block at a time, mutating the session's
//! variable store and calling the [`HardwareBridge`] for I/O blocks. The
//! main loop is index-based; all jump targets were resolved at compile
//! time.
//!
//! Control: a `watch` channel carries the externally requested state.
//! Pause takes effect after the current block finishes; stop cancels
//! in-flight waits, hardware calls, and retry backoffs, and issues
//! best-effort OFF commands to every actuator the session left on.

use crate::bridge::{ActuatorState, BridgeError, DoseSpec, HardwareBridge, SensorReading};
use crate::context::{compare, VarValue, VariableStore};
use crate::error::{EngineError, Result};
use crate::events::{EventSink, FlowEvent};
use crate::params::{
    ActuatorAction, ActuatorSetParams, BlockParams, ErrorPolicy, FlowControlType, LogLevel,
    LoopMode, OnFailure, SensorReadParams,
};
use crate::session::{ExecutionSession, SessionError, SessionLogEntry, SessionStatus};
use crate::types::VarScope;
use crate::validation::{CompiledBlock, CompiledFlow};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Externally requested execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// Create a control channel pair for one session.
pub fn control_channel() -> (watch::Sender<ControlSignal>, watch::Receiver<ControlSignal>) {
    watch::channel(ControlSignal::Run)
}

/// Default whole-session step guard.
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

struct LoopFrame {
    block: usize,
    iterations: u32,
    /// COUNT mode target, resolved when the frame is opened.
    target: Option<u64>,
}

struct Compensation {
    device_id: String,
    handle: tokio::task::JoinHandle<std::result::Result<(), BridgeError>>,
}

enum Disposition {
    Continue,
    Jump(usize),
    Abort(String),
}

/// Why a block's primary action produced no result.
enum StepError {
    /// Stop observed while the action was in flight or backing off.
    Stopped,
    Failed(String),
}

/// Executes compiled flows against a hardware bridge.
pub struct FlowExecutor {
    bridge: Arc<dyn HardwareBridge>,
    events: Arc<dyn EventSink>,
    max_steps: u64,
}

impl FlowExecutor {
    pub fn new(bridge: Arc<dyn HardwareBridge>, events: Arc<dyn EventSink>) -> Self {
        Self {
            bridge,
            events,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    fn emit(&self, event: FlowEvent) {
        if let Err(e) = self.events.emit(event) {
            log::warn!("Event sink rejected event: {e}");
        }
    }

    fn set_status(&self, session: &mut ExecutionSession, status: SessionStatus) {
        session.status = status;
        self.emit(FlowEvent::SessionStateChanged {
            session_id: session.id.clone(),
            status,
        });
    }

    /// Run a loaded session to completion, stop, or failure.
    ///
    /// `inputs` supplies caller-provided global variable values.
    pub async fn execute(
        &self,
        flow: &CompiledFlow,
        session: &mut ExecutionSession,
        inputs: BTreeMap<String, VarValue>,
        mut control: watch::Receiver<ControlSignal>,
    ) -> Result<()> {
        if !session.status.can_transition(SessionStatus::Running) {
            return Err(EngineError::InvalidTransition {
                from: session.status.to_string(),
                to: SessionStatus::Running.to_string(),
            });
        }

        let mut vars = VariableStore::from_decls(&flow.variables);
        for (id, value) in inputs {
            vars.set(&id, value)?;
        }
        // Non-tolerant globals must have a value before the walk starts.
        for decl in &flow.variables {
            if decl.scope == VarScope::Global && !decl.tolerant && vars.get(&decl.id).is_none() {
                return Err(EngineError::UnresolvedVariable {
                    block_id: flow.blocks[flow.start].id.clone(),
                    variable: decl.id.clone(),
                });
            }
        }

        session.start_time = Some(chrono::Utc::now());
        self.set_status(session, SessionStatus::Running);
        log::info!("Session {} running flow '{}'", session.id, flow.flow_id);

        let mut open_actuators: HashSet<String> = HashSet::new();
        let mut compensations: Vec<Compensation> = Vec::new();
        let mut loop_stack: Vec<LoopFrame> = Vec::new();
        let mut idx = flow.start;

        loop {
            // External control, between blocks only.
            let signal = *control.borrow();
            match signal {
                ControlSignal::Stop => {
                    return self
                        .finish_stopped(session, &mut open_actuators, &mut compensations)
                        .await;
                }
                ControlSignal::Pause => {
                    self.set_status(session, SessionStatus::Paused);
                    loop {
                        if control.changed().await.is_err() {
                            return self
                                .finish_stopped(session, &mut open_actuators, &mut compensations)
                                .await;
                        }
                        let signal = *control.borrow();
                        match signal {
                            ControlSignal::Run => break,
                            ControlSignal::Stop => {
                                return self
                                    .finish_stopped(
                                        session,
                                        &mut open_actuators,
                                        &mut compensations,
                                    )
                                    .await;
                            }
                            ControlSignal::Pause => {}
                        }
                    }
                    self.set_status(session, SessionStatus::Running);
                }
                ControlSignal::Run => {}
            }

            if session.step_count >= self.max_steps {
                let err = EngineError::StepLimitExceeded {
                    limit: self.max_steps,
                };
                return Err(self.fail(session, None, err, &mut compensations).await);
            }

            let block = &flow.blocks[idx];
            session.step_count += 1;
            session.current_block_id = Some(block.id.clone());
            self.emit(FlowEvent::BlockStarted {
                session_id: session.id.clone(),
                block_id: block.id.clone(),
                block_type: block.block_type.to_string(),
            });
            log::debug!("Session {} executing block '{}'", session.id, block.id);

            let next: Option<usize> = match &block.params {
                BlockParams::Start => block.next,

                BlockParams::End => {
                    if let Err(err) = self.join_compensations(session, &mut compensations).await {
                        self.set_status(session, SessionStatus::Failed);
                        return Err(err);
                    }
                    session.variables = vars.snapshot();
                    self.set_status(session, SessionStatus::Completed);
                    log::info!("Session {} completed", session.id);
                    return Ok(());
                }

                BlockParams::Log(p) => {
                    let message = vars.interpolate(&p.message);
                    match p.level {
                        LogLevel::Debug => log::debug!("[{}] {}", session.id, message),
                        LogLevel::Info => log::info!("[{}] {}", session.id, message),
                        LogLevel::Warning => log::warn!("[{}] {}", session.id, message),
                        LogLevel::Error => log::error!("[{}] {}", session.id, message),
                    }
                    session.logs.push(SessionLogEntry::new(p.level, &message));
                    self.emit(FlowEvent::LogEmitted {
                        session_id: session.id.clone(),
                        level: p.level,
                        message,
                    });
                    block.next
                }

                BlockParams::Wait(p) => match vars.resolve_number(&block.id, &p.duration) {
                    Ok(ms) => {
                        let duration = Duration::from_millis(ms.max(0.0) as u64);
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => block.next,
                            _ = wait_for_stop(&mut control) => {
                                return self
                                    .finish_stopped(session, &mut open_actuators, &mut compensations)
                                    .await;
                            }
                        }
                    }
                    Err(err) => match self.dispose(session, block, err.to_string()) {
                        Disposition::Continue => block.next,
                        Disposition::Jump(i) => Some(i),
                        Disposition::Abort(message) => {
                            let err = EngineError::Hardware {
                                block_id: block.id.clone(),
                                message,
                            };
                            return Err(self.fail(session, Some(block), err, &mut compensations).await);
                        }
                    },
                },

                BlockParams::SensorRead(p) => {
                    match self.read_with_retries(session, block, p, &mut control).await {
                        Ok(SensorReading::Value(value)) => {
                            vars.set(&p.variable, VarValue::Number(value))?;
                            block.next
                        }
                        Ok(SensorReading::Skipped) => {
                            log::debug!(
                                "Session {} read of '{}' skipped; '{}' left untouched",
                                session.id,
                                p.device_id,
                                p.variable
                            );
                            block.next
                        }
                        Err(StepError::Stopped) => {
                            return self
                                .finish_stopped(session, &mut open_actuators, &mut compensations)
                                .await;
                        }
                        Err(StepError::Failed(message)) => match self.dispose(session, block, message) {
                            Disposition::Continue => block.next,
                            Disposition::Jump(i) => Some(i),
                            Disposition::Abort(message) => {
                                let err = EngineError::Hardware {
                                    block_id: block.id.clone(),
                                    message,
                                };
                                return Err(
                                    self.fail(session, Some(block), err, &mut compensations).await
                                );
                            }
                        },
                    }
                }

                BlockParams::ActuatorSet(p) => {
                    match self
                        .run_actuator(
                            session,
                            block,
                            p,
                            &vars,
                            &mut open_actuators,
                            &mut compensations,
                            &mut control,
                        )
                        .await
                    {
                        Ok(()) => block.next,
                        Err(StepError::Stopped) => {
                            // The commanded state is unknown; include the
                            // device in the best-effort OFF sweep.
                            open_actuators.insert(p.device_id.clone());
                            return self
                                .finish_stopped(session, &mut open_actuators, &mut compensations)
                                .await;
                        }
                        Err(StepError::Failed(message)) => match self.dispose(session, block, message) {
                            Disposition::Continue => block.next,
                            Disposition::Jump(i) => Some(i),
                            Disposition::Abort(message) => {
                                let err = EngineError::Hardware {
                                    block_id: block.id.clone(),
                                    message,
                                };
                                return Err(
                                    self.fail(session, Some(block), err, &mut compensations).await
                                );
                            }
                        },
                    }
                }

                BlockParams::Condition(p) => {
                    match vars.require(&block.id, &p.variable) {
                        Ok(lhs) => {
                            let rhs = VarValue::from_json(None, &p.value);
                            match rhs {
                                Some(rhs) => {
                                    if compare(p.operator, lhs, &rhs) {
                                        block.on_true
                                    } else {
                                        block.on_false
                                    }
                                }
                                None => {
                                    let err = EngineError::Hardware {
                                        block_id: block.id.clone(),
                                        message: "condition value is not comparable".to_string(),
                                    };
                                    return Err(
                                        self.fail(session, Some(block), err, &mut compensations)
                                            .await,
                                    );
                                }
                            }
                        }
                        Err(err) => match self.dispose(session, block, err.to_string()) {
                            Disposition::Continue => block.on_false,
                            Disposition::Jump(i) => Some(i),
                            Disposition::Abort(message) => {
                                let err = EngineError::Hardware {
                                    block_id: block.id.clone(),
                                    message,
                                };
                                return Err(
                                    self.fail(session, Some(block), err, &mut compensations).await
                                );
                            }
                        },
                    }
                }

                BlockParams::Loop(p) => {
                    let on_top = loop_stack.last().map(|f| f.block == idx).unwrap_or(false);
                    if !on_top {
                        let target = match p.mode {
                            LoopMode::Count => match &p.count {
                                Some(count) => match vars.resolve_number(&block.id, count) {
                                    Ok(n) => Some(n.max(0.0) as u64),
                                    Err(err) => {
                                        return Err(self
                                            .fail(session, Some(block), err, &mut compensations)
                                            .await);
                                    }
                                },
                                None => Some(0),
                            },
                            LoopMode::While => None,
                        };
                        loop_stack.push(LoopFrame {
                            block: idx,
                            iterations: 0,
                            target,
                        });
                    }
                    let frame_iterations = loop_stack.last().map(|f| f.iterations).unwrap_or(0);
                    match p.mode {
                        LoopMode::Count => {
                            let target = loop_stack
                                .last()
                                .and_then(|f| f.target)
                                .unwrap_or(0);
                            if u64::from(frame_iterations) >= target {
                                loop_stack.pop();
                                block.after
                            } else {
                                if let Some(frame) = loop_stack.last_mut() {
                                    frame.iterations += 1;
                                }
                                block.body
                            }
                        }
                        LoopMode::While => {
                            let variable = p.variable.as_deref().unwrap_or_default();
                            let lhs = match vars.require(&block.id, variable) {
                                Ok(v) => v.clone(),
                                Err(err) => {
                                    return Err(self
                                        .fail(session, Some(block), err, &mut compensations)
                                        .await);
                                }
                            };
                            let rhs = p
                                .value
                                .as_ref()
                                .and_then(|v| VarValue::from_json(None, v));
                            let op = p.operator.unwrap_or(crate::params::CompareOp::Eq);
                            let keep_going =
                                rhs.map(|rhs| compare(op, &lhs, &rhs)).unwrap_or(false);
                            if !keep_going {
                                loop_stack.pop();
                                block.after
                            } else if frame_iterations >= p.max_iterations {
                                let err = EngineError::RunawayGuard {
                                    block_id: block.id.clone(),
                                    max_iterations: p.max_iterations,
                                };
                                return Err(self
                                    .fail(session, Some(block), err, &mut compensations)
                                    .await);
                            } else {
                                if let Some(frame) = loop_stack.last_mut() {
                                    frame.iterations += 1;
                                }
                                block.body
                            }
                        }
                    }
                }

                BlockParams::FlowControl(fc) => match fc.control_type {
                    FlowControlType::Label => block.next,
                    FlowControlType::Goto => block.jump,
                    FlowControlType::LoopBack => {
                        // Restart the target loop: drop its frame (and any
                        // inner frames) so arrival opens a fresh one.
                        if let Some(jump) = block.jump {
                            if let Some(pos) =
                                loop_stack.iter().position(|f| f.block == jump)
                            {
                                loop_stack.truncate(pos);
                            }
                        }
                        block.jump
                    }
                    FlowControlType::LoopBreak => match loop_stack.pop() {
                        Some(frame) => flow.blocks[frame.block].after,
                        None => {
                            let err = EngineError::LoopBreakOutsideLoop {
                                block_id: block.id.clone(),
                            };
                            return Err(self
                                .fail(session, Some(block), err, &mut compensations)
                                .await);
                        }
                    },
                },
            };

            session.variables = vars.snapshot();
            self.emit(FlowEvent::BlockCompleted {
                session_id: session.id.clone(),
                block_id: block.id.clone(),
            });

            match next {
                Some(i) => idx = i,
                None => {
                    // Validation guarantees successors; a hole here is a bug.
                    let err = EngineError::Hardware {
                        block_id: block.id.clone(),
                        message: "block has no successor".to_string(),
                    };
                    return Err(self.fail(session, Some(block), err, &mut compensations).await);
                }
            }
        }
    }

    /// One bridge read with the block's retry policy. Both the call and the
    /// backoff between attempts yield to a stop request.
    async fn read_with_retries(
        &self,
        session: &ExecutionSession,
        block: &CompiledBlock,
        params: &SensorReadParams,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> std::result::Result<SensorReading, StepError> {
        let policy = &block.policy;
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                r = self.bridge.read_sensor(&params.device_id) => r,
                _ = wait_for_stop(control) => return Err(StepError::Stopped),
            };
            match result {
                Ok(reading) => return Ok(reading),
                Err(err) => {
                    if err.retryable() && attempt < policy.retry_count {
                        attempt += 1;
                        self.emit(FlowEvent::BlockFailed {
                            session_id: session.id.clone(),
                            block_id: block.id.clone(),
                            error: err.to_string(),
                            will_retry: true,
                        });
                        log::warn!(
                            "Session {} block '{}' retrying ({}/{}): {}",
                            session.id,
                            block.id,
                            attempt,
                            policy.retry_count,
                            err
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)) => {}
                            _ = wait_for_stop(control) => return Err(StepError::Stopped),
                        }
                        continue;
                    }
                    return Err(StepError::Failed(err.to_string()));
                }
            }
        }
    }

    async fn actuate_with_retries(
        &self,
        session: &ExecutionSession,
        block: &CompiledBlock,
        device_id: &str,
        state: ActuatorState,
        policy: &ErrorPolicy,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> std::result::Result<(), StepError> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                r = self.bridge.set_actuator(device_id, state) => r,
                _ = wait_for_stop(control) => return Err(StepError::Stopped),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.retryable() && attempt < policy.retry_count {
                        attempt += 1;
                        self.emit(FlowEvent::BlockFailed {
                            session_id: session.id.clone(),
                            block_id: block.id.clone(),
                            error: err.to_string(),
                            will_retry: true,
                        });
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)) => {}
                            _ = wait_for_stop(control) => return Err(StepError::Stopped),
                        }
                        continue;
                    }
                    return Err(StepError::Failed(err.to_string()));
                }
            }
        }
    }

    async fn run_actuator(
        &self,
        session: &ExecutionSession,
        block: &CompiledBlock,
        params: &ActuatorSetParams,
        vars: &VariableStore,
        open_actuators: &mut HashSet<String>,
        compensations: &mut Vec<Compensation>,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> std::result::Result<(), StepError> {
        let device_id = &params.device_id;
        match params.action {
            ActuatorAction::On => {
                self.actuate_with_retries(
                    session,
                    block,
                    device_id,
                    ActuatorState::On,
                    &block.policy,
                    control,
                )
                .await?;
                open_actuators.insert(device_id.clone());
            }
            ActuatorAction::Off => {
                self.actuate_with_retries(
                    session,
                    block,
                    device_id,
                    ActuatorState::Off,
                    &block.policy,
                    control,
                )
                .await?;
                open_actuators.remove(device_id);
            }
            ActuatorAction::PulseOn | ActuatorAction::PulseOff => {
                let duration = params
                    .duration_ms
                    .as_ref()
                    .ok_or_else(|| StepError::Failed("pulse requires a duration".to_string()))?;
                let ms = vars
                    .resolve_number(&block.id, duration)
                    .map_err(|e| StepError::Failed(e.to_string()))?
                    .max(0.0) as u64;
                let initial = if params.action == ActuatorAction::PulseOn {
                    ActuatorState::On
                } else {
                    ActuatorState::Off
                };
                self.actuate_with_retries(session, block, device_id, initial, &block.policy, control)
                    .await?;
                compensations.push(self.schedule_compensation(device_id, initial.inverse(), ms));
            }
            ActuatorAction::Dose => {
                let spec = match (&params.volume_ml, &params.amount) {
                    (Some(volume), _) => DoseSpec::VolumeMl(
                        vars.resolve_number(&block.id, volume)
                            .map_err(|e| StepError::Failed(e.to_string()))?,
                    ),
                    (None, Some(amount)) => DoseSpec::Doses(
                        vars.resolve_number(&block.id, amount)
                            .map_err(|e| StepError::Failed(e.to_string()))?,
                    ),
                    (None, None) => {
                        return Err(StepError::Failed(
                            "DOSE requires an amount or a volume".to_string(),
                        ))
                    }
                };
                let ms = self
                    .bridge
                    .dose_duration_ms(device_id, spec)
                    .await
                    .map_err(|e| StepError::Failed(e.to_string()))?;
                self.actuate_with_retries(
                    session,
                    block,
                    device_id,
                    ActuatorState::On,
                    &block.policy,
                    control,
                )
                .await?;
                log::info!(
                    "Session {} dosing '{}' for {}ms",
                    session.id,
                    device_id,
                    ms
                );
                compensations.push(self.schedule_compensation(device_id, ActuatorState::Off, ms));
            }
        }
        Ok(())
    }

    /// Schedule the compensating command for a timed actuation. The task
    /// outlives the block: fire-and-verify, joined before the session ends.
    fn schedule_compensation(
        &self,
        device_id: &str,
        state: ActuatorState,
        delay_ms: u64,
    ) -> Compensation {
        let bridge = self.bridge.clone();
        let device = device_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            bridge.set_actuator(&device, state).await
        });
        Compensation {
            device_id: device_id.to_string(),
            handle,
        }
    }

    /// Join every pending compensation. Failures are safety-critical and
    /// reported regardless of any block policy.
    async fn join_compensations(
        &self,
        session: &mut ExecutionSession,
        compensations: &mut Vec<Compensation>,
    ) -> Result<()> {
        let mut first_failure: Option<EngineError> = None;
        for comp in compensations.drain(..) {
            let Compensation { device_id, handle } = comp;
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join_err) if join_err.is_cancelled() => None,
                Err(join_err) => Some(join_err.to_string()),
            };
            if let Some(detail) = failure {
                log::error!(
                    "Compensating command for '{}' failed: {detail}",
                    device_id
                );
                session.errors.push(SessionError::new(
                    None,
                    format!("compensating command for '{device_id}' failed: {detail}"),
                    true,
                ));
                self.emit(FlowEvent::BlockFailed {
                    session_id: session.id.clone(),
                    block_id: device_id.clone(),
                    error: detail.clone(),
                    will_retry: false,
                });
                if first_failure.is_none() {
                    first_failure = Some(EngineError::CompensationFailed { device_id, detail });
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop path: cancel pending compensations and best-effort OFF every
    /// actuator that may still be on. OFF failures are escalated.
    async fn finish_stopped(
        &self,
        session: &mut ExecutionSession,
        open_actuators: &mut HashSet<String>,
        compensations: &mut Vec<Compensation>,
    ) -> Result<()> {
        log::info!("Session {} stopping", session.id);
        let mut to_switch_off: HashSet<String> = open_actuators.drain().collect();
        for comp in compensations.drain(..) {
            comp.handle.abort();
            to_switch_off.insert(comp.device_id);
        }

        let mut failure: Option<EngineError> = None;
        for device_id in to_switch_off {
            if let Err(err) = self.bridge.set_actuator(&device_id, ActuatorState::Off).await {
                log::error!("Best-effort OFF for '{device_id}' failed: {err}");
                session.errors.push(SessionError::new(
                    None,
                    format!("best-effort OFF for '{device_id}' failed: {err}"),
                    true,
                ));
                if failure.is_none() {
                    failure = Some(EngineError::CompensationFailed {
                        device_id,
                        detail: err.to_string(),
                    });
                }
            }
        }

        self.set_status(session, SessionStatus::Stopped);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Exhausted-failure bookkeeping: append the session error, emit the
    /// event, and translate the block's policy into a disposition.
    fn dispose(
        &self,
        session: &mut ExecutionSession,
        block: &CompiledBlock,
        message: String,
    ) -> Disposition {
        let fatal = block.policy.on_failure == OnFailure::Abort;
        session
            .errors
            .push(SessionError::new(Some(block.id.clone()), &message, fatal));
        self.emit(FlowEvent::BlockFailed {
            session_id: session.id.clone(),
            block_id: block.id.clone(),
            error: message.clone(),
            will_retry: false,
        });
        if block.policy.error_notification {
            log::error!(
                "Operator notification: session {} block '{}' failed: {}",
                session.id,
                block.id,
                message
            );
        }
        match block.policy.on_failure {
            OnFailure::Abort => Disposition::Abort(message),
            OnFailure::Continue => Disposition::Continue,
            OnFailure::Goto => match block.error_jump {
                Some(i) => Disposition::Jump(i),
                None => Disposition::Abort(message),
            },
        }
    }

    /// Fatal-path bookkeeping: join compensations, record the error, mark
    /// the session failed, and hand the error back for propagation.
    async fn fail(
        &self,
        session: &mut ExecutionSession,
        block: Option<&CompiledBlock>,
        error: EngineError,
        compensations: &mut Vec<Compensation>,
    ) -> EngineError {
        let _ = self.join_compensations(session, compensations).await;
        session.errors.push(SessionError::new(
            block.map(|b| b.id.clone()),
            error.to_string(),
            true,
        ));
        if let Some(block) = block {
            self.emit(FlowEvent::BlockFailed {
                session_id: session.id.clone(),
                block_id: block.id.clone(),
                error: error.to_string(),
                will_retry: false,
            });
        }
        self.set_status(session, SessionStatus::Failed);
        log::error!("Session {} failed: {error}", session.id);
        error
    }
}

/// Resolves only when a stop is requested (or the controller went away).
async fn wait_for_stop(control: &mut watch::Receiver<ControlSignal>) {
    loop {
        if *control.borrow() == ControlSignal::Stop {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}
