//! Transport configuration.
//!
//! A flat, serde-friendly view of every tunable: reconnection backoff,
//! heartbeat, correlation and buffer sizes. Typed views convert it into the
//! per-component config structs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffStrategy, ReconnectConfig};
use crate::correlation::cached::CachedConfig;
use crate::correlation::reactive::ReactiveConfig;
use crate::error::TransportError;
use crate::pipeline::heartbeat::HeartbeatConfig;

/// Complete transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// How reconnect delays grow.
    pub backoff_strategy: BackoffStrategy,
    /// Base reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Cap for linear and exponential delays in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Stop reconnecting after this many consecutive failures (None = never).
    pub max_attempts: Option<u32>,
    /// WebSocket handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to run the heartbeat monitor.
    pub heartbeat_enabled: bool,
    /// Interval between pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Time to wait for each pong in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive missed pongs before the connection is recycled.
    pub max_missed_heartbeats: u32,
    /// Ping payload.
    pub ping_payload: String,
    /// Pong payload (exact match).
    pub pong_payload: String,
    /// Reactive call timeout in milliseconds.
    pub per_call_timeout_ms: u64,
    /// Field carrying the correlation id in reactive mode.
    pub correlation_id_field: String,
    /// Field carrying the correlation id in cached mode.
    pub cache_id_field: String,
    /// Field carrying the result value in cached mode.
    pub cache_value_field: String,
    /// How long an unclaimed cached result is retained, in milliseconds.
    pub cache_grace_ms: u64,
    /// Cached-mode wait timeout in milliseconds.
    pub cache_wait_timeout_ms: u64,
    /// Outbound queue depth.
    pub send_buffer: usize,
    /// Event broadcast depth.
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff_strategy: BackoffStrategy::Constant,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
            connect_timeout_ms: 10_000,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            max_missed_heartbeats: 3,
            ping_payload: "ping".to_string(),
            pong_payload: "pong".to_string(),
            per_call_timeout_ms: 30_000,
            correlation_id_field: "id".to_string(),
            cache_id_field: "requestId".to_string(),
            cache_value_field: "value".to_string(),
            cache_grace_ms: 60_000,
            cache_wait_timeout_ms: 600_000,
            send_buffer: 256,
            event_buffer: 1_024,
        }
    }
}

impl TransportConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TransportError::Configuration(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, TransportError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| TransportError::Configuration(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TransportError::Configuration(format!("failed to serialize: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<(), TransportError> {
        fn invalid(msg: &str) -> Result<(), TransportError> {
            Err(TransportError::Configuration(msg.to_string()))
        }

        if self.max_delay_ms < self.base_delay_ms {
            return invalid("max_delay_ms must be at least base_delay_ms");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be a finite number >= 1.0");
        }
        if self.max_attempts == Some(0) {
            return invalid("max_attempts must be greater than 0 when set");
        }
        if self.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms must be greater than 0");
        }

        if self.heartbeat_enabled {
            if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms == 0 {
                return invalid("heartbeat interval and timeout must be greater than 0");
            }
            if self.max_missed_heartbeats == 0 {
                return invalid("max_missed_heartbeats must be greater than 0");
            }
            if self.ping_payload.is_empty() || self.pong_payload.is_empty() {
                return invalid("ping_payload and pong_payload cannot be empty");
            }
        }

        if self.per_call_timeout_ms == 0 || self.cache_wait_timeout_ms == 0 {
            return invalid("correlation timeouts must be greater than 0");
        }
        if self.correlation_id_field.is_empty()
            || self.cache_id_field.is_empty()
            || self.cache_value_field.is_empty()
        {
            return invalid("correlation field names cannot be empty");
        }
        if self.send_buffer == 0 || self.event_buffer == 0 {
            return invalid("send_buffer and event_buffer must be greater than 0");
        }

        Ok(())
    }

    /// Reconnection settings.
    #[must_use]
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            strategy: self.backoff_strategy,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_attempts: self.max_attempts,
        }
    }

    /// Heartbeat settings, or `None` when the heartbeat is disabled.
    #[must_use]
    pub fn heartbeat(&self) -> Option<HeartbeatConfig> {
        self.heartbeat_enabled.then(|| HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            max_missed: self.max_missed_heartbeats,
            ping: self.ping_payload.clone(),
            pong: self.pong_payload.clone(),
        })
    }

    /// Reactive correlation settings.
    #[must_use]
    pub fn correlation(&self) -> ReactiveConfig {
        ReactiveConfig {
            id_field: self.correlation_id_field.clone(),
            timeout: Duration::from_millis(self.per_call_timeout_ms),
        }
    }

    /// Cached correlation settings.
    #[must_use]
    pub fn cache(&self) -> CachedConfig {
        CachedConfig {
            id_field: self.cache_id_field.clone(),
            value_field: self.cache_value_field.clone(),
            grace: Duration::from_millis(self.cache_grace_ms),
            wait_timeout: Duration::from_millis(self.cache_wait_timeout_ms),
        }
    }

    /// WebSocket handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
