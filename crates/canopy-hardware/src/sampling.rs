//! Sampling & validation pipeline: one physical read -> one trustworthy
//! value.
//!
//! A read takes a burst of samples, reduces them by median, range-checks
//! the result, retries on failure, and finally applies the configured
//! fallback. Fallbacks that substitute a value (`useLastValid`,
//! `useDefault`) are bounded: once a sensor has failed too often or its
//! last good reading is too old, the pipeline escalates to an error so a
//! dead sensor cannot be masked indefinitely.

use crate::compiler::CommandPayload;
use crate::error::ReadError;
use crate::transport::CommandDispatcher;
use canopy_topology::ValueRange;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when a read still fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackAction {
    Error,
    UseLastValid,
    UseDefault,
    Skip,
}

impl Default for FallbackAction {
    fn default() -> Self {
        FallbackAction::Error
    }
}

/// Per-read policy. Usually assembled from the template's validation
/// config with device-level overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingConfig {
    /// Readings per burst; medians reject single-sample noise.
    pub sample_count: u32,
    pub sample_delay_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub fallback: FallbackAction,
    /// Substitute for `useDefault`.
    pub default_value: Option<f64>,
    /// Oldest a last-good reading may be and still back a fallback.
    pub stale_timeout_ms: u64,
    /// Consecutive failed reads tolerated before fallbacks stop masking.
    pub stale_limit: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_count: 1,
            sample_delay_ms: 0,
            retry_count: 2,
            retry_delay_ms: 1000,
            fallback: FallbackAction::Error,
            default_value: None,
            stale_timeout_ms: 60_000,
            stale_limit: 5,
        }
    }
}

/// Result of a vetted read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadOutcome {
    Value(f64),
    /// The `skip` fallback fired: no value, caller proceeds without one.
    Skipped,
}

#[derive(Debug, Default)]
struct DeviceReadState {
    consecutive_failures: u32,
    last_valid: Option<(f64, Instant)>,
}

/// Stateful read pipeline shared by all sessions.
pub struct SamplingPipeline {
    dispatcher: Arc<CommandDispatcher>,
    state: Mutex<HashMap<String, DeviceReadState>>,
}

impl SamplingPipeline {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            dispatcher,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Take one vetted reading from a device.
    ///
    /// `value_key` selects the field of the response body carrying the raw
    /// value (default `"value"`). `range` is the effective hardware range
    /// after device overrides; see [`effective_range`].
    pub async fn read(
        &self,
        device_id: &str,
        controller_id: &str,
        payload: &CommandPayload,
        value_key: Option<&str>,
        range: ValueRange,
        cfg: &SamplingConfig,
    ) -> Result<ReadOutcome, ReadError> {
        let mut last_error: Option<ReadError> = None;
        for attempt in 0..=cfg.retry_count {
            if attempt > 0 {
                log::debug!(
                    "Retrying read of '{}' (attempt {}/{})",
                    device_id,
                    attempt + 1,
                    cfg.retry_count + 1
                );
                tokio::time::sleep(Duration::from_millis(cfg.retry_delay_ms)).await;
            }
            match self
                .sample_burst(device_id, controller_id, payload, value_key, cfg)
                .await
            {
                Ok(value) => {
                    if let Some(err) = check_range(device_id, value, &range) {
                        last_error = Some(err);
                        continue;
                    }
                    let mut state = self.state.lock();
                    let entry = state.entry(device_id.to_string()).or_default();
                    entry.consecutive_failures = 0;
                    entry.last_valid = Some((value, Instant::now()));
                    return Ok(ReadOutcome::Value(value));
                }
                Err(err) => last_error = Some(err),
            }
        }

        let error = match last_error {
            Some(err) => err,
            None => ReadError::NonNumeric {
                device_id: device_id.to_string(),
                raw: String::new(),
            },
        };
        self.apply_fallback(device_id, cfg, error)
    }

    async fn sample_burst(
        &self,
        device_id: &str,
        controller_id: &str,
        payload: &CommandPayload,
        value_key: Option<&str>,
        cfg: &SamplingConfig,
    ) -> Result<f64, ReadError> {
        let count = cfg.sample_count.max(1);
        let mut samples = Vec::with_capacity(count as usize);
        for i in 0..count {
            if i > 0 && cfg.sample_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(cfg.sample_delay_ms)).await;
            }
            let response = self.dispatcher.dispatch(controller_id, payload).await?;
            samples.push(extract_raw_value(device_id, &response.values, value_key)?);
        }
        Ok(median(&mut samples))
    }

    fn apply_fallback(
        &self,
        device_id: &str,
        cfg: &SamplingConfig,
        error: ReadError,
    ) -> Result<ReadOutcome, ReadError> {
        let mut state = self.state.lock();
        let entry = state.entry(device_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        let failures = entry.consecutive_failures;
        let last_valid = entry.last_valid;
        drop(state);

        log::warn!(
            "Read of '{}' failed ({} consecutive): {}",
            device_id,
            failures,
            error
        );
        match cfg.fallback {
            FallbackAction::Error => Err(error),
            FallbackAction::Skip => Ok(ReadOutcome::Skipped),
            FallbackAction::UseLastValid | FallbackAction::UseDefault => {
                if failures > cfg.stale_limit {
                    return Err(ReadError::StaleSensor {
                        device_id: device_id.to_string(),
                        consecutive_failures: failures,
                    });
                }
                let Some((value, taken_at)) = last_valid else {
                    return Err(ReadError::NoLastValid {
                        device_id: device_id.to_string(),
                    });
                };
                if taken_at.elapsed().as_millis() as u64 >= cfg.stale_timeout_ms {
                    return Err(ReadError::StaleSensor {
                        device_id: device_id.to_string(),
                        consecutive_failures: failures,
                    });
                }
                match cfg.fallback {
                    FallbackAction::UseLastValid => Ok(ReadOutcome::Value(value)),
                    _ => match cfg.default_value {
                        Some(default) => Ok(ReadOutcome::Value(default)),
                        None => Err(ReadError::NoDefault {
                            device_id: device_id.to_string(),
                        }),
                    },
                }
            }
        }
    }
}

/// Intersect the template's hardware range with a device override.
pub fn effective_range(template: Option<ValueRange>, device: Option<ValueRange>) -> ValueRange {
    let t = template.unwrap_or_default();
    let d = device.unwrap_or_default();
    let pick = |a: Option<f64>, b: Option<f64>, wider: bool| match (a, b) {
        (Some(a), Some(b)) => Some(if wider { a.min(b) } else { a.max(b) }),
        (x, None) | (None, x) => x,
    };
    ValueRange {
        min: pick(t.min, d.min, false),
        max: pick(t.max, d.max, true),
    }
}

fn check_range(device_id: &str, value: f64, range: &ValueRange) -> Option<ReadError> {
    let min = range.min.unwrap_or(f64::NEG_INFINITY);
    let max = range.max.unwrap_or(f64::INFINITY);
    if value < min || value > max {
        Some(ReadError::OutOfRange {
            device_id: device_id.to_string(),
            value,
            min,
            max,
        })
    } else {
        None
    }
}

fn extract_raw_value(
    device_id: &str,
    body: &serde_json::Value,
    value_key: Option<&str>,
) -> Result<f64, ReadError> {
    let key = value_key.unwrap_or("value");
    let raw = match body {
        serde_json::Value::Object(map) => map.get(key).unwrap_or(&serde_json::Value::Null),
        other => other,
    };
    match raw {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| ReadError::NonNumeric {
            device_id: device_id.to_string(),
            raw: n.to_string(),
        }),
        serde_json::Value::String(s) => s.parse::<f64>().map_err(|_| ReadError::NonNumeric {
            device_id: device_id.to_string(),
            raw: s.clone(),
        }),
        other => Err(ReadError::NonNumeric {
            device_id: device_id.to_string(),
            raw: other.to_string(),
        }),
    }
}

fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn pipeline(mock: Arc<MockTransport>) -> SamplingPipeline {
        SamplingPipeline::new(Arc::new(CommandDispatcher::new(mock)))
    }

    fn payload() -> CommandPayload {
        CommandPayload {
            command: "ANALOG".to_string(),
            params: Default::default(),
            timeout_ms: 1000,
        }
    }

    fn fast(fallback: FallbackAction) -> SamplingConfig {
        SamplingConfig {
            retry_count: 0,
            retry_delay_ms: 0,
            fallback,
            ..Default::default()
        }
    }

    fn no_response() -> TransportError {
        TransportError::NoResponse {
            controller_id: "ctrl-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_median_rejects_burst_noise() {
        let mock = Arc::new(MockTransport::new());
        for v in [5.9, 100.0, 6.1] {
            mock.push_value(json!({"value": v}));
        }
        let pipe = pipeline(mock);
        let cfg = SamplingConfig {
            sample_count: 3,
            ..fast(FallbackAction::Error)
        };
        let out = pipe
            .read("ph-1", "ctrl-1", &payload(), None, ValueRange::default(), &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(6.1));
    }

    #[tokio::test]
    async fn test_even_burst_averages_middle_pair() {
        let mock = Arc::new(MockTransport::new());
        for v in [1.0, 2.0, 3.0, 4.0] {
            mock.push_value(json!({"value": v}));
        }
        let pipe = pipeline(mock);
        let cfg = SamplingConfig {
            sample_count: 4,
            ..fast(FallbackAction::Error)
        };
        let out = pipe
            .read("ph-1", "ctrl-1", &payload(), None, ValueRange::default(), &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(2.5));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = Arc::new(MockTransport::new());
        mock.push_error(no_response());
        mock.push_value(json!({"value": 7.0}));
        let pipe = pipeline(mock);
        let cfg = SamplingConfig {
            retry_count: 1,
            retry_delay_ms: 0,
            ..fast(FallbackAction::Error)
        };
        let out = pipe
            .read("ph-1", "ctrl-1", &payload(), None, ValueRange::default(), &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(7.0));
    }

    #[tokio::test]
    async fn test_out_of_range_escalates() {
        let mock = Arc::new(MockTransport::new());
        mock.set_default_value(json!({"value": 99.0}));
        let pipe = pipeline(mock);
        let range = ValueRange {
            min: Some(0.0),
            max: Some(14.0),
        };
        let err = pipe
            .read("ph-1", "ctrl-1", &payload(), None, range, &fast(FallbackAction::Error))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::OutOfRange { value, .. } if value == 99.0));
    }

    #[tokio::test]
    async fn test_use_last_valid_until_failure_limit() {
        let mock = Arc::new(MockTransport::new());
        mock.push_value(json!({"value": 7.0}));
        let pipe = pipeline(mock.clone());
        let cfg = SamplingConfig {
            stale_limit: 2,
            stale_timeout_ms: 600_000,
            ..fast(FallbackAction::UseLastValid)
        };

        let range = ValueRange::default();
        let out = pipe
            .read("ph-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(7.0));

        // Two failures are masked by the last good value...
        for _ in 0..2 {
            mock.push_error(no_response());
            let out = pipe
                .read("ph-1", "ctrl-1", &payload(), None, range, &cfg)
                .await
                .unwrap();
            assert_eq!(out, ReadOutcome::Value(7.0));
        }

        // ...the third exceeds staleLimit and escalates.
        mock.push_error(no_response());
        let err = pipe
            .read("ph-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReadError::StaleSensor {
                consecutive_failures: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_timeout_defeats_fallback() {
        let mock = Arc::new(MockTransport::new());
        mock.push_value(json!({"value": 7.0}));
        let pipe = pipeline(mock.clone());
        let cfg = SamplingConfig {
            stale_limit: 10,
            stale_timeout_ms: 0,
            ..fast(FallbackAction::UseLastValid)
        };
        let range = ValueRange::default();
        pipe.read("ph-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap();

        mock.push_error(no_response());
        let err = pipe
            .read("ph-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::StaleSensor { .. }));
    }

    #[tokio::test]
    async fn test_use_default_and_skip() {
        let mock = Arc::new(MockTransport::new());
        mock.push_value(json!({"value": 7.0}));
        let pipe = pipeline(mock.clone());
        let range = ValueRange::default();

        let cfg = SamplingConfig {
            default_value: Some(6.5),
            stale_timeout_ms: 600_000,
            ..fast(FallbackAction::UseDefault)
        };
        pipe.read("ec-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap();
        mock.push_error(no_response());
        let out = pipe
            .read("ec-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(6.5));

        mock.push_error(no_response());
        let cfg = fast(FallbackAction::Skip);
        let out = pipe
            .read("ec-1", "ctrl-1", &payload(), None, range, &cfg)
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_value_key_and_non_numeric() {
        let mock = Arc::new(MockTransport::new());
        mock.push_value(json!({"distanceCm": "42.5"}));
        let pipe = pipeline(mock.clone());
        let out = pipe
            .read(
                "sonar-1",
                "ctrl-1",
                &payload(),
                Some("distanceCm"),
                ValueRange::default(),
                &fast(FallbackAction::Error),
            )
            .await
            .unwrap();
        assert_eq!(out, ReadOutcome::Value(42.5));

        mock.push_value(json!({"value": "not-a-number"}));
        let err = pipe
            .read(
                "sonar-1",
                "ctrl-1",
                &payload(),
                None,
                ValueRange::default(),
                &fast(FallbackAction::Error),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::NonNumeric { .. }));
    }

    #[test]
    fn test_effective_range_intersection() {
        let template = Some(ValueRange {
            min: Some(0.0),
            max: Some(14.0),
        });
        let device = Some(ValueRange {
            min: Some(4.0),
            max: None,
        });
        let range = effective_range(template, device);
        assert_eq!(range.min, Some(4.0));
        assert_eq!(range.max, Some(14.0));
    }
}
