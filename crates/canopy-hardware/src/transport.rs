//! The outbound hardware seam.
//!
//! [`Transport`] is implemented by real serial/network backends outside this
//! crate. [`CommandDispatcher`] wraps a transport with the concurrency
//! rules: one in-flight command per controller, per-command timeouts,
//! different controllers in parallel.

use crate::compiler::CommandPayload;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Parsed response from a controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    /// Response body as parsed by the backend, e.g. `{"value": 23.5}`.
    pub values: serde_json::Value,
}

impl TransportResponse {
    pub fn new(values: serde_json::Value) -> Self {
        Self { values }
    }
}

/// Capability to deliver one command to one controller and await its reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        controller_id: &str,
        payload: &CommandPayload,
    ) -> Result<TransportResponse, TransportError>;
}

/// Serializes command dispatch per controller and enforces timeouts.
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    /// One async lock per controller; created lazily.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn controller_lock(&self, controller_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(controller_id.to_string())
            .or_default()
            .clone()
    }

    /// Send a command, holding the controller's slot for the duration.
    ///
    /// The timeout is the payload's template-declared one and counts only
    /// the wire round-trip, not time spent queued behind other commands.
    pub async fn dispatch(
        &self,
        controller_id: &str,
        payload: &CommandPayload,
    ) -> Result<TransportResponse, TransportError> {
        let lock = self.controller_lock(controller_id);
        let _slot = lock.lock().await;
        log::debug!(
            "Dispatching {} to controller {} (timeout {}ms)",
            payload.command,
            controller_id,
            payload.timeout_ms
        );
        match tokio::time::timeout(
            Duration::from_millis(payload.timeout_ms),
            self.transport.send(controller_id, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                controller_id: controller_id.to_string(),
                timeout_ms: payload.timeout_ms,
            }),
        }
    }
}

/// Scripted transport for tests and dry runs.
///
/// Responses are consumed in FIFO order; when the queue is empty the
/// default response (if any) is returned, else `NoResponse`.
#[derive(Default)]
pub struct MockTransport {
    queue: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    default_response: Mutex<Option<TransportResponse>>,
    sent: Mutex<Vec<(String, CommandPayload)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response carrying the given body.
    pub fn push_value(&self, values: serde_json::Value) {
        self.queue
            .lock()
            .push_back(Ok(TransportResponse::new(values)));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: TransportError) {
        self.queue.lock().push_back(Err(error));
    }

    /// Respond with this body whenever the queue is empty.
    pub fn set_default_value(&self, values: serde_json::Value) {
        *self.default_response.lock() = Some(TransportResponse::new(values));
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<(String, CommandPayload)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        controller_id: &str,
        payload: &CommandPayload,
    ) -> Result<TransportResponse, TransportError> {
        self.sent
            .lock()
            .push((controller_id.to_string(), payload.clone()));
        if let Some(scripted) = self.queue.lock().pop_front() {
            return scripted;
        }
        if let Some(default) = self.default_response.lock().clone() {
            return Ok(default);
        }
        Err(TransportError::NoResponse {
            controller_id: controller_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(command: &str, timeout_ms: u64) -> CommandPayload {
        CommandPayload {
            command: command.to_string(),
            params: Default::default(),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = Arc::new(MockTransport::new());
        mock.push_value(json!({"value": 1.0}));
        mock.push_error(TransportError::NoResponse {
            controller_id: "ctrl-1".to_string(),
        });

        let dispatcher = CommandDispatcher::new(mock.clone());
        let first = dispatcher.dispatch("ctrl-1", &payload("ANALOG", 100)).await;
        assert_eq!(first.unwrap().values, json!({"value": 1.0}));
        let second = dispatcher.dispatch("ctrl-1", &payload("ANALOG", 100)).await;
        assert!(second.is_err());
        assert_eq!(mock.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_default_response_after_queue_drains() {
        let mock = Arc::new(MockTransport::new());
        mock.set_default_value(json!({"value": 23.5}));
        let dispatcher = CommandDispatcher::new(mock);
        for _ in 0..3 {
            let resp = dispatcher
                .dispatch("ctrl-1", &payload("ANALOG", 100))
                .await
                .unwrap();
            assert_eq!(resp.values["value"], json!(23.5));
        }
    }

    /// A transport that never answers, for timeout coverage.
    struct BlackHole;

    #[async_trait]
    impl Transport for BlackHole {
        async fn send(
            &self,
            _controller_id: &str,
            _payload: &CommandPayload,
        ) -> Result<TransportResponse, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let dispatcher = CommandDispatcher::new(Arc::new(BlackHole));
        let err = dispatcher
            .dispatch("ctrl-1", &payload("ANALOG", 250))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { timeout_ms: 250, .. }));
    }
}
