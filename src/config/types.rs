//! Configuration types

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Signal detector settings
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Broadcaster / feed server settings
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Exchange gateway policy settings
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

/// EMA detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Fast EMA period
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    /// Slow EMA period; also the minimum number of closes before seeding
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    /// Candle polling cadence in seconds. Decoupled from the candle
    /// interval because exchanges return partially-formed current candles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Number of candles requested per poll
    #[serde(default = "default_candle_limit")]
    pub candle_limit: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            poll_interval_seconds: default_poll_interval(),
            candle_limit: default_candle_limit(),
        }
    }
}

fn default_fast_period() -> usize {
    9
}

fn default_slow_period() -> usize {
    21
}

fn default_poll_interval() -> u64 {
    60
}

fn default_candle_limit() -> u32 {
    41
}

/// Broadcaster and feed-server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Bound per-connection outbound queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consecutive full-queue publishes tolerated before forced disconnect
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_seconds: u64,
    /// Address the websocket feed server binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            degraded_threshold: default_degraded_threshold(),
            keepalive_interval_seconds: default_keepalive_interval(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_queue_capacity() -> usize {
    32
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_bind_addr() -> String {
    "0.0.0.0:9001".to_string()
}

/// Gateway retry and rate-limit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Minimum spacing between calls to the same exchange+credential pair
    #[serde(default = "default_min_request_interval")]
    pub min_request_interval_ms: u64,
    /// Retry attempts per call (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry backoff in milliseconds, doubling per attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            min_request_interval_ms: default_min_request_interval(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

fn default_min_request_interval() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    2000
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = AppConfig::default();
        assert_eq!(config.detector.fast_period, 9);
        assert_eq!(config.detector.slow_period, 21);
        assert_eq!(config.broadcast.queue_capacity, 32);
        assert_eq!(config.gateway.min_request_interval_ms, 100);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.gateway.initial_backoff_ms, 200);
        assert_eq!(config.gateway.max_backoff_ms, 2000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: AppConfig =
            toml_like(r#"{"detector": {"fast_period": 12}, "settings": {"log_level": "debug"}}"#);
        assert_eq!(parsed.detector.fast_period, 12);
        assert_eq!(parsed.detector.slow_period, 21);
        assert_eq!(parsed.settings.log_level, "debug");
    }

    fn toml_like(json: &str) -> AppConfig {
        serde_json::from_str(json).unwrap()
    }
}
