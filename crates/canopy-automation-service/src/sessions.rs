//! Session orchestration: load, start, pause, resume, stop.
//!
//! Each started session runs in its own tokio task. The manager keeps a
//! shared snapshot of every session's state, kept live for status by a
//! mirroring event sink and fully synchronized when the task finishes.

use crate::error::{Result, ServiceError};
use crate::store::FlowStore;
use flow_engine::executor::{control_channel, ControlSignal, FlowExecutor};
use flow_engine::{
    compile_flow, CompiledFlow, EngineError, EventError, EventSink, ExecutionSession, FlowEvent,
    FlowGraph, HardwareBridge, SessionStatus, VarValue,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Forwards events to the host sink and mirrors state changes into the
/// manager's shared session snapshot, so status queries stay live while
/// the executor owns its working copy.
struct SessionMirror {
    shared: Arc<Mutex<ExecutionSession>>,
    inner: Arc<dyn EventSink>,
}

impl EventSink for SessionMirror {
    fn emit(&self, event: FlowEvent) -> std::result::Result<(), EventError> {
        if let FlowEvent::SessionStateChanged { status, .. } = &event {
            self.shared.lock().status = *status;
        }
        self.inner.emit(event)
    }
}

struct ActiveSession {
    shared: Arc<Mutex<ExecutionSession>>,
    compiled: Arc<CompiledFlow>,
    control: watch::Sender<ControlSignal>,
    receiver: Option<watch::Receiver<ControlSignal>>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the flow library and every execution session.
pub struct SessionManager {
    bridge: Arc<dyn HardwareBridge>,
    events: Arc<dyn EventSink>,
    store: Mutex<FlowStore>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        bridge: Arc<dyn HardwareBridge>,
        events: Arc<dyn EventSink>,
        store: FlowStore,
    ) -> Self {
        Self {
            bridge,
            events,
            store: Mutex::new(store),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Flow library
    // =========================================================================

    pub fn insert_flow(&self, flow: FlowGraph) -> Result<()> {
        self.store.lock().insert_flow(flow)
    }

    pub fn remove_flow(&self, flow_id: &str) -> Result<Option<FlowGraph>> {
        self.store.lock().remove_flow(flow_id)
    }

    pub fn list_flows(&self) -> Vec<crate::store::FlowMetadata> {
        self.store.lock().list_flows()
    }

    pub fn load_flows_from_disk(&self) -> Result<usize> {
        self.store.lock().load_from_disk()
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Validate and compile a flow, creating a `loaded` session for it.
    ///
    /// Returns the new session's id. Validation failures are collected and
    /// surfaced as one error; nothing is created.
    pub fn load_flow(&self, flow_id: &str) -> Result<String> {
        let compiled = {
            let store = self.store.lock();
            let graph = store.require_flow(flow_id)?;
            compile_flow(graph).map_err(EngineError::Validation)?
        };

        let mut session = ExecutionSession::new(flow_id);
        session.status = SessionStatus::Loaded;
        let session_id = session.id.clone();
        log::info!("Loaded flow '{}' as session {}", flow_id, session_id);

        let (control, receiver) = control_channel();
        self.sessions.lock().insert(
            session_id.clone(),
            ActiveSession {
                shared: Arc::new(Mutex::new(session)),
                compiled: Arc::new(compiled),
                control,
                receiver: Some(receiver),
                handle: None,
            },
        );
        Ok(session_id)
    }

    /// Start a loaded session, spawning its executor task.
    ///
    /// `inputs` supplies values for the flow's global variables.
    pub fn start(&self, session_id: &str, inputs: BTreeMap<String, VarValue>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let active = sessions
            .get_mut(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;

        let status = active.shared.lock().status;
        if status != SessionStatus::Loaded {
            return Err(ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: "start".to_string(),
            });
        }
        let receiver = active
            .receiver
            .take()
            .ok_or_else(|| ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: "start".to_string(),
            })?;

        let shared = active.shared.clone();
        let compiled = active.compiled.clone();
        let executor = FlowExecutor::new(
            self.bridge.clone(),
            Arc::new(SessionMirror {
                shared: shared.clone(),
                inner: self.events.clone(),
            }),
        );

        active.handle = Some(tokio::spawn(async move {
            let mut working = shared.lock().clone();
            let result = executor.execute(&compiled, &mut working, inputs, receiver).await;
            if let Err(err) = &result {
                log::error!("Session {} ended with error: {err}", working.id);
            }
            *shared.lock() = working;
        }));
        Ok(())
    }

    /// Request a pause. Takes effect after the current block finishes.
    pub fn pause(&self, session_id: &str) -> Result<()> {
        self.signal(session_id, SessionStatus::Running, "pause", ControlSignal::Pause)
    }

    /// Resume a paused session.
    pub fn resume(&self, session_id: &str) -> Result<()> {
        self.signal(session_id, SessionStatus::Paused, "resume", ControlSignal::Run)
    }

    /// Request a stop. The executor cancels in-flight waits and issues
    /// best-effort OFF commands before the session reaches `stopped`.
    pub fn stop(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock();
        let active = sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        let status = active.shared.lock().status;
        if !matches!(status, SessionStatus::Running | SessionStatus::Paused) {
            return Err(ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: "stop".to_string(),
            });
        }
        // Send failure means the task already finished; the status check
        // above makes that a benign race.
        let _ = active.control.send(ControlSignal::Stop);
        Ok(())
    }

    fn signal(
        &self,
        session_id: &str,
        expected: SessionStatus,
        requested: &str,
        signal: ControlSignal,
    ) -> Result<()> {
        let sessions = self.sessions.lock();
        let active = sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        let status = active.shared.lock().status;
        if status != expected {
            return Err(ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: requested.to_string(),
            });
        }
        let _ = active.control.send(signal);
        Ok(())
    }

    /// Snapshot of a session's current state.
    pub fn session(&self, session_id: &str) -> Result<ExecutionSession> {
        let sessions = self.sessions.lock();
        let active = sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        let snapshot = active.shared.lock().clone();
        Ok(snapshot)
    }

    /// Snapshots of all known sessions.
    pub fn list_sessions(&self) -> Vec<ExecutionSession> {
        self.sessions
            .lock()
            .values()
            .map(|a| a.shared.lock().clone())
            .collect()
    }

    /// Wait for a started session's task to finish, then return its final
    /// state. Errors if the session was never started.
    pub async fn wait_for_end(&self, session_id: &str) -> Result<ExecutionSession> {
        let handle = {
            let mut sessions = self.sessions.lock();
            let active = sessions
                .get_mut(session_id)
                .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
            active.handle.take()
        };
        let Some(handle) = handle else {
            let status = self.session(session_id)?.status;
            return Err(ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: "wait".to_string(),
            });
        };
        if let Err(e) = handle.await {
            log::error!("Session {} task panicked: {e}", session_id);
        }
        self.session(session_id)
    }

    /// Drop a terminal session's record. Running sessions must be stopped
    /// first.
    pub fn remove_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let active = sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        let status = active.shared.lock().status;
        if !status.is_terminal() && status != SessionStatus::Loaded {
            return Err(ServiceError::InvalidOperation {
                session_id: session_id.to_string(),
                status: status.to_string(),
                requested: "remove".to_string(),
            });
        }
        sessions.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flow_engine::{
        ActuatorState, BridgeError, DoseSpec, FlowBuilder, NullEventSink, SensorReading,
        VarType, VariableDecl,
    };

    /// Bridge that answers every read with a fixed value.
    struct FixedBridge(f64);

    #[async_trait]
    impl HardwareBridge for FixedBridge {
        async fn read_sensor(&self, _device_id: &str) -> std::result::Result<SensorReading, BridgeError> {
            Ok(SensorReading::Value(self.0))
        }

        async fn set_actuator(
            &self,
            _device_id: &str,
            _state: ActuatorState,
        ) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn dose_duration_ms(
            &self,
            _device_id: &str,
            _spec: DoseSpec,
        ) -> std::result::Result<u64, BridgeError> {
            Ok(0)
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(FixedBridge(6.8)),
            Arc::new(NullEventSink),
            FlowStore::new(),
        )
    }

    #[tokio::test]
    async fn test_load_start_and_finish() {
        let mgr = manager();
        let flow = FlowBuilder::new("f1", "Read")
            .start("s", "r")
            .sensor_read("r", "ph-1", "ph", "e")
            .end("e")
            .variable(VariableDecl::local("ph", "pH", VarType::Number))
            .build();
        mgr.insert_flow(flow).unwrap();

        let session_id = mgr.load_flow("f1").unwrap();
        assert_eq!(mgr.session(&session_id).unwrap().status, SessionStatus::Loaded);

        mgr.start(&session_id, BTreeMap::new()).unwrap();
        let session = mgr.wait_for_end(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.variables.get("ph"), Some(&VarValue::Number(6.8)));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_flow() {
        let mgr = manager();
        // No START block.
        let flow = FlowBuilder::new("broken", "Broken").end("e").build();
        mgr.insert_flow(flow).unwrap();
        let err = mgr.load_flow("broken").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_flow_and_session() {
        let mgr = manager();
        assert!(matches!(
            mgr.load_flow("ghost"),
            Err(ServiceError::FlowNotFound(_))
        ));
        assert!(matches!(
            mgr.session("ghost"),
            Err(ServiceError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mgr = manager();
        let flow = FlowBuilder::new("f1", "Short").start("s", "e").end("e").build();
        mgr.insert_flow(flow).unwrap();
        let session_id = mgr.load_flow("f1").unwrap();
        mgr.start(&session_id, BTreeMap::new()).unwrap();
        mgr.wait_for_end(&session_id).await.unwrap();
        let err = mgr.start(&session_id, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOperation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_stop() {
        let mgr = manager();
        let flow = FlowBuilder::new("f1", "Long")
            .start("s", "w")
            .wait("w", 60_000, "w2")
            .wait("w2", 60_000, "e")
            .end("e")
            .build();
        mgr.insert_flow(flow).unwrap();
        let session_id = mgr.load_flow("f1").unwrap();
        mgr.start(&session_id, BTreeMap::new()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(mgr.session(&session_id).unwrap().status, SessionStatus::Running);

        // Pause lands after the current WAIT finishes.
        mgr.pause(&session_id).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(70_000)).await;
        assert_eq!(mgr.session(&session_id).unwrap().status, SessionStatus::Paused);

        mgr.resume(&session_id).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(mgr.session(&session_id).unwrap().status, SessionStatus::Running);

        mgr.stop(&session_id).unwrap();
        let session = mgr.wait_for_end(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);

        // Terminal sessions can be removed, then they are gone.
        mgr.remove_session(&session_id).unwrap();
        assert!(mgr.session(&session_id).is_err());
    }
}
