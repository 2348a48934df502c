//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds >= 1, windows > 0)
//! - Check that a pinned strategy names a built-in table
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted by a controller

use crate::batching::strategy::builtin_strategy_names;
use crate::config::schema::{BatchingConfig, BreakerConfig, PipelineConfig, UploadConfig};

/// A single semantic problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a complete upload configuration.
pub fn validate_config(config: &UploadConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_breaker(&config.breaker, &mut errors);
    collect_batching(&config.batching, &mut errors);
    collect_pipeline(&config.pipeline, &mut errors);
    into_result(errors)
}

/// Validate the circuit breaker section on its own.
pub fn validate_breaker(config: &BreakerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_breaker(config, &mut errors);
    into_result(errors)
}

/// Validate the batching section on its own.
pub fn validate_batching(config: &BatchingConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_batching(config, &mut errors);
    into_result(errors)
}

/// Validate the pipeline section on its own.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_pipeline(config, &mut errors);
    into_result(errors)
}

fn into_result(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn collect_breaker(config: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    if config.failure_threshold < 1 {
        errors.push(ValidationError::new("breaker.failure_threshold", "must be at least 1"));
    }
    if config.success_threshold < 1 {
        errors.push(ValidationError::new("breaker.success_threshold", "must be at least 1"));
    }
    if config.time_window_ms == 0 {
        errors.push(ValidationError::new("breaker.time_window_ms", "must be greater than 0"));
    }
    if config.max_cooldown_ms == 0 {
        errors.push(ValidationError::new("breaker.max_cooldown_ms", "must be greater than 0"));
    }
    if config.recovery_time_ms > config.max_cooldown_ms {
        errors.push(ValidationError::new(
            "breaker.recovery_time_ms",
            format!(
                "{} exceeds max_cooldown_ms ({})",
                config.recovery_time_ms, config.max_cooldown_ms
            ),
        ));
    }
    if config.half_open_max_requests < 1 {
        errors.push(ValidationError::new("breaker.half_open_max_requests", "must be at least 1"));
    }
    if config.half_open_window_ms == 0 {
        errors.push(ValidationError::new("breaker.half_open_window_ms", "must be greater than 0"));
    }
}

fn collect_batching(config: &BatchingConfig, errors: &mut Vec<ValidationError>) {
    if config.initial_batch_size < 1 {
        errors.push(ValidationError::new("batching.initial_batch_size", "must be at least 1"));
    }
    if let Some(name) = &config.strategy {
        if !builtin_strategy_names().contains(&name.as_str()) {
            errors.push(ValidationError::new(
                "batching.strategy",
                format!("unknown strategy '{}'", name),
            ));
        }
    }
}

fn collect_pipeline(config: &PipelineConfig, errors: &mut Vec<ValidationError>) {
    if config.max_refusals < 1 {
        errors.push(ValidationError::new("pipeline.max_refusals", "must be at least 1"));
    }
    if config.max_batch_attempts < 1 {
        errors.push(ValidationError::new("pipeline.max_batch_attempts", "must be at least 1"));
    }
}
