//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for an upload
//! session. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for an upload session.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,

    /// Progressive batch reduction settings.
    pub batching: BatchingConfig,

    /// Orchestration loop settings.
    pub pipeline: PipelineConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit (before adaptation).
    pub failure_threshold: u32,

    /// Base cooldown in the open state, in milliseconds.
    pub recovery_time_ms: u64,

    /// Successes needed in half-open to close the circuit.
    pub success_threshold: u32,

    /// Rolling window for failure counting, in milliseconds.
    pub time_window_ms: u64,

    /// Cap on the open-state duration, in milliseconds.
    pub max_cooldown_ms: u64,

    /// Scale threshold and cooldown by the adaptive multiplier and health.
    pub enable_adaptive_thresholds: bool,

    /// Trial requests allowed per half-open window.
    pub half_open_max_requests: u32,

    /// Length of the half-open rate-limit window, in milliseconds.
    pub half_open_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time_ms: 30_000,
            success_threshold: 3,
            time_window_ms: 60_000,
            max_cooldown_ms: 300_000,
            enable_adaptive_thresholds: true,
            half_open_max_requests: 3,
            half_open_window_ms: 5_000,
        }
    }
}

/// Partial update applied through `CircuitBreaker::update_config`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfigUpdate {
    pub failure_threshold: Option<u32>,
    pub recovery_time_ms: Option<u64>,
    pub success_threshold: Option<u32>,
    pub time_window_ms: Option<u64>,
    pub max_cooldown_ms: Option<u64>,
    pub enable_adaptive_thresholds: Option<bool>,
    pub half_open_max_requests: Option<u32>,
    pub half_open_window_ms: Option<u64>,
}

impl BreakerConfig {
    /// Return a copy of this config with the update's fields applied.
    pub fn merged(&self, update: &BreakerConfigUpdate) -> Self {
        Self {
            failure_threshold: update.failure_threshold.unwrap_or(self.failure_threshold),
            recovery_time_ms: update.recovery_time_ms.unwrap_or(self.recovery_time_ms),
            success_threshold: update.success_threshold.unwrap_or(self.success_threshold),
            time_window_ms: update.time_window_ms.unwrap_or(self.time_window_ms),
            max_cooldown_ms: update.max_cooldown_ms.unwrap_or(self.max_cooldown_ms),
            enable_adaptive_thresholds: update
                .enable_adaptive_thresholds
                .unwrap_or(self.enable_adaptive_thresholds),
            half_open_max_requests: update
                .half_open_max_requests
                .unwrap_or(self.half_open_max_requests),
            half_open_window_ms: update.half_open_window_ms.unwrap_or(self.half_open_window_ms),
        }
    }
}

/// Progressive batch reduction configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BatchingConfig {
    /// Batch size at the start of a session.
    pub initial_batch_size: usize,

    /// Pin a strategy by name. `None` selects automatically on every decision.
    pub strategy: Option<String>,

    /// Base delay between batches, in milliseconds.
    pub base_delay_ms: u64,

    /// Successful batches slower than this do not count toward growth.
    pub growth_processing_limit_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
            strategy: None,
            base_delay_ms: 200,
            growth_processing_limit_ms: 15_000,
        }
    }
}

/// Upload loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Breaker refusals without a successful write before the upload is abandoned.
    pub max_refusals: u32,

    /// Upper bound on any single advisory wait, in milliseconds.
    pub max_wait_ms: u64,

    /// Attempts at one batch before it is abandoned.
    pub max_batch_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_refusals: 20,
            max_wait_ms: 30_000,
            max_batch_attempts: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
