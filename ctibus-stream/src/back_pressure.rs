//! Producer throttling for synchronizers
//!
//! A synchronizer consuming a remote platform's live stream queues events
//! locally. When the queue grows past `max_queue_size` the remote connection
//! is asked to slow down; once it drains below `min_queue_size` the normal
//! pace is restored. Only transitions issue a request.

use async_trait::async_trait;
use ctibus_core::config::SyncConfig;
use ctibus_core::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureMode {
    Low,
    High,
}

/// Adjusts the delay a remote producer waits between events
#[async_trait]
pub trait DelayControl: Send + Sync {
    async fn set_delay(&self, delay: Duration) -> Result<()>;
}

/// Remote stream connection driven over the platform's HTTP API
pub struct HttpDelayControl {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl std::fmt::Debug for HttpDelayControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDelayControl")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// `https://host/stream/live` -> `https://host/`
fn http_base(uri: &str) -> String {
    let base = uri
        .find("/stream")
        .map_or(uri, |idx| &uri[..idx])
        .trim_end_matches('/');
    format!("{base}/")
}

impl HttpDelayControl {
    pub fn new(uri: &str, connection_id: &str, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}stream/connection/{connection_id}", http_base(uri)),
            token: token.into(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DelayControl for HttpDelayControl {
    async fn set_delay(&self, delay: Duration) -> Result<()> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "delay": delay_ms }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Store(format!("delay update failed: {e}")))?;
        Ok(())
    }
}

pub struct BackPressureController {
    control: Arc<dyn DelayControl>,
    min_queue_size: usize,
    max_queue_size: usize,
    low_delay: Duration,
    high_delay: Duration,
    mode: Mutex<PressureMode>,
}

impl BackPressureController {
    #[must_use]
    pub fn new(control: Arc<dyn DelayControl>, config: &SyncConfig) -> Self {
        Self {
            control,
            min_queue_size: config.min_queue_size,
            max_queue_size: config.max_queue_size,
            low_delay: Duration::from_millis(config.low_delay_ms),
            high_delay: Duration::from_millis(config.high_delay_ms),
            mode: Mutex::new(PressureMode::Low),
        }
    }

    #[must_use]
    pub fn mode(&self) -> PressureMode {
        *self.mode.lock()
    }

    /// Feed the current queue length. A failed delay request leaves the mode
    /// unchanged so the next observation retries.
    pub async fn observe(&self, queue_len: usize) -> PressureMode {
        let current = self.mode();
        let (target, delay) = match current {
            PressureMode::Low if queue_len > self.max_queue_size => (PressureMode::High, self.high_delay),
            PressureMode::High if queue_len < self.min_queue_size => (PressureMode::Low, self.low_delay),
            _ => return current,
        };

        match self.control.set_delay(delay).await {
            Ok(()) => {
                info!(queue_len, mode = ?target, delay = ?delay, "Adjusted remote stream delay");
                *self.mode.lock() = target;
                target
            }
            Err(e) => {
                warn!(queue_len, error = %e, "Failed to adjust remote stream delay");
                current
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingControl {
        delays: Mutex<Vec<Duration>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DelayControl for RecordingControl {
        async fn set_delay(&self, delay: Duration) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Store("unreachable".to_string()));
            }
            self.delays.lock().push(delay);
            Ok(())
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            min_queue_size: 10,
            max_queue_size: 50,
            low_delay_ms: 10,
            high_delay_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_hysteresis() {
        let control = Arc::new(RecordingControl::default());
        let controller = BackPressureController::new(control.clone(), &config());

        assert_eq!(controller.observe(30).await, PressureMode::Low);
        assert_eq!(controller.observe(51).await, PressureMode::High);
        // Between the thresholds nothing changes
        assert_eq!(controller.observe(30).await, PressureMode::High);
        assert_eq!(controller.observe(80).await, PressureMode::High);
        assert_eq!(controller.observe(9).await, PressureMode::Low);

        assert_eq!(
            *control.delays.lock(),
            vec![Duration::from_millis(1_000), Duration::from_millis(10)]
        );
    }

    #[tokio::test]
    async fn test_failed_request_keeps_mode() {
        let control = Arc::new(RecordingControl::default());
        control.failing.store(true, Ordering::SeqCst);
        let controller = BackPressureController::new(control.clone(), &config());

        assert_eq!(controller.observe(100).await, PressureMode::Low);
        control.failing.store(false, Ordering::SeqCst);
        assert_eq!(controller.observe(100).await, PressureMode::High);
        assert_eq!(control.delays.lock().len(), 1);
    }

    #[test]
    fn test_endpoint_from_stream_uri() {
        let control = HttpDelayControl::new("https://cti.example.com/stream/live", "conn-1", "token").unwrap();
        assert_eq!(control.endpoint(), "https://cti.example.com/stream/connection/conn-1");

        let control = HttpDelayControl::new("http://localhost:4000/", "c", "t").unwrap();
        assert_eq!(control.endpoint(), "http://localhost:4000/stream/connection/c");
    }
}
