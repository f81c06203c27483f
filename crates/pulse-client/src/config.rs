//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use pulse_core::event::from_seconds;
use pulse_core::{BackoffConfig, ValidationError};

use crate::dispatch::DispatchConfig;

/// Default address of a local event store.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:5600";

/// Everything a [`Client`](crate::Client) needs at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Name reported to the server when creating buckets; also scopes the
    /// default queue directory.
    pub client_name: String,
    /// Overrides the queue location (default `<data dir>/pulse/queued/<client_name>`).
    pub queue_dir: Option<PathBuf>,
    /// Merge window used when a heartbeat does not specify one.
    pub pulsetime_secs: f64,
    /// Maximum events per delivery request.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Candidates untouched for this long are queued. `0` disables.
    pub idle_flush_secs: u64,
    /// Queue depth above which a warning is logged. Nothing is ever dropped.
    pub queue_soft_cap: Option<usize>,
    pub backoff: BackoffConfig,
    pub request_timeout_ms: u64,
    /// How long shutdown waits for the queue to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            client_name: "unknown".to_string(),
            queue_dir: None,
            pulsetime_secs: 60.0,
            batch_size: 100,
            poll_interval_ms: 5_000,
            idle_flush_secs: 120,
            queue_soft_cap: Some(100_000),
            backoff: BackoffConfig::default(),
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// The directory holding the durable queue.
    ///
    /// On Linux: `~/.local/share/pulse/queued/<client_name>`
    pub fn resolved_queue_dir(&self) -> PathBuf {
        self.queue_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pulse")
                .join("queued")
                .join(&self.client_name)
        })
    }

    pub fn pulsetime(&self) -> Result<TimeDelta, ValidationError> {
        if self.pulsetime_secs < 0.0 {
            return Err(ValidationError::NegativePulsetime {
                seconds: self.pulsetime_secs,
            });
        }
        from_seconds(self.pulsetime_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub const fn idle_flush(&self) -> Option<Duration> {
        if self.idle_flush_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_flush_secs))
        }
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            backoff: self.backoff,
        }
    }
}
