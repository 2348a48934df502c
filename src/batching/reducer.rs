//! Progressive batch-size reduction.
//!
//! The reducer turns the outcome of the last batch into the size and delay of
//! the next one. Failures walk down the active strategy's ladder; three fast
//! successes in a row grow the batch by 20% again, never past the size the
//! session started with.
//!
//! # Invariants
//! - `current_batch_size` stays within `1..=original_batch_size`
//! - a reduction never produces a size below the entered stage's floor unless
//!   the size was already below it, and never increases the size
//! - `current_stage` only moves forward until `reset()`
//! - `total_reductions <= max_reduction_attempts`
//! - the returned `batch_size` never exceeds `remaining_records`

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::batching::classify::{classify, BatchError, ErrorKind};
use crate::batching::strategy::{
    builtin_strategies, conservative, ReductionStrategy, TriggerCondition, AGGRESSIVE,
    CONSERVATIVE, CONSTRAINT_FOCUSED,
};
use crate::clock::{self, Clock};
use crate::config::validation::validate_batching;
use crate::config::{BatchingConfig, ConfigError, ValidationError};
use crate::observability::metrics;
use crate::resilience::health::{ConnectionHealth, SystemHealth};

const SUCCESS_STREAK_FOR_GROWTH: u32 = 3;
const GROWTH_FACTOR: f64 = 1.2;
const FAILURE_STREAK_FOR_REDUCTION: u32 = 3;
const SUCCESS_EXPECTATION: f64 = 85.0;

/// Connection signals the reducer consults when selecting a strategy.
pub type ConnectionMetrics = SystemHealth;

/// Outcome of the last batch attempt, as reported by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub error: Option<BatchError>,
    pub processing_time_ms: u64,
    pub retry_count: u32,
}

impl BatchResult {
    pub fn success(processing_time_ms: u64) -> Self {
        Self {
            success: true,
            processing_time_ms,
            ..Default::default()
        }
    }

    pub fn failure(error: BatchError, processing_time_ms: u64, retry_count: u32) -> Self {
        Self {
            success: false,
            error: Some(error),
            processing_time_ms,
            retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchDecision {
    pub batch_size: usize,
    pub delay_ms: u64,
    pub should_retry: bool,
    pub should_use_individual_records: bool,
    pub reasoning: String,
    pub confidence: Confidence,
    /// Estimated chance (5-95) that the next batch succeeds.
    pub expected_success_rate: f64,
    pub strategy: String,
    pub stage: usize,
}

/// One entry of the reduction log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionRecord {
    pub timestamp_ms: u64,
    pub from_size: usize,
    pub to_size: usize,
    pub reason: String,
    pub stage: usize,
}

/// Mutable state of one upload session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReductionState {
    pub strategy: String,
    pub current_stage: usize,
    pub current_batch_size: usize,
    pub original_batch_size: usize,
    pub total_reductions: u32,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub timeout_count: u32,
    pub constraint_error_count: u32,
    pub memory_error_count: u32,
    pub network_error_count: u32,
    pub last_reduction_reason: Option<String>,
    pub reduction_history: Vec<ReductionRecord>,
}

impl BatchReductionState {
    fn new(initial_batch_size: usize, strategy: &str) -> Self {
        let size = initial_batch_size.max(1);
        Self {
            strategy: strategy.to_string(),
            current_stage: 0,
            current_batch_size: size,
            original_batch_size: size,
            total_reductions: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            timeout_count: 0,
            constraint_error_count: 0,
            memory_error_count: 0,
            network_error_count: 0,
            last_reduction_reason: None,
            reduction_history: Vec::new(),
        }
    }
}

/// Qualitative read of how the session is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effectiveness {
    Effective,
    Improving,
    Struggling,
    Failing,
    Untested,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionSummary {
    pub strategy: String,
    pub original_batch_size: usize,
    pub current_batch_size: usize,
    pub reduction_percent: f64,
    pub current_stage: usize,
    pub total_reductions: u32,
    /// Reductions of at least 10 records, or down to a single record.
    pub milestones: Vec<ReductionRecord>,
    pub effectiveness: Effectiveness,
    pub last_reduction_reason: Option<String>,
}

/// Batch-size controller for one upload session.
pub struct ProgressiveBatchReducer {
    config: BatchingConfig,
    strategies: BTreeMap<String, ReductionStrategy>,
    state: BatchReductionState,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProgressiveBatchReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveBatchReducer")
            .field("config", &self.config)
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl ProgressiveBatchReducer {
    pub fn new(config: BatchingConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: BatchingConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        validate_batching(&config).map_err(ConfigError::Validation)?;
        let strategies = builtin_strategies()
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let initial = config.initial_batch_size;
        let mut reducer = Self {
            state: BatchReductionState::new(initial, CONSERVATIVE),
            config,
            strategies,
            clock,
        };
        reducer.initialize_state(initial);
        Ok(reducer)
    }

    /// Start a session at `initial_batch_size`.
    pub fn initialize_state(&mut self, initial_batch_size: usize) {
        let strategy = self.config.strategy.as_deref().unwrap_or(CONSERVATIVE);
        self.state = BatchReductionState::new(initial_batch_size, strategy);
        metrics::set_batch_size(self.state.current_batch_size);
        debug!(
            batch_size = self.state.current_batch_size,
            strategy = %self.state.strategy,
            "Batch reduction session initialized"
        );
    }

    /// Discard the session and start over.
    pub fn reset(&mut self, initial_batch_size: usize) {
        self.initialize_state(initial_batch_size);
    }

    /// Pin a registered strategy, or return to automatic selection with `None`.
    pub fn set_strategy(&mut self, name: Option<&str>) -> Result<(), ConfigError> {
        if let Some(name) = name {
            if !self.strategies.contains_key(name) {
                return Err(ConfigError::Validation(vec![ValidationError {
                    field: "batching.strategy",
                    message: format!("unknown strategy '{}'", name),
                }]));
            }
            self.state.strategy = name.to_string();
        }
        self.config.strategy = name.map(str::to_string);
        Ok(())
    }

    /// Register or replace a strategy under `name`.
    pub fn add_strategy(
        &mut self,
        name: impl Into<String>,
        mut strategy: ReductionStrategy,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let mut errors = Vec::new();
        if strategy.stages.is_empty() {
            errors.push(ValidationError {
                field: "strategy.stages",
                message: format!("strategy '{}' has no stages", name),
            });
        }
        if strategy.stages.iter().any(|s| s.reduction_percentage > 100 || s.batch_size == 0) {
            errors.push(ValidationError {
                field: "strategy.stages",
                message: "reduction_percentage must be 0-100 and batch_size at least 1".into(),
            });
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        strategy.name = name.clone();
        self.strategies.insert(name, strategy);
        Ok(())
    }

    /// Registered strategies in name order.
    pub fn strategies(&self) -> impl Iterator<Item = &ReductionStrategy> {
        self.strategies.values()
    }

    #[must_use]
    pub fn current_state(&self) -> &BatchReductionState {
        &self.state
    }

    fn select_strategy(&self, connection: Option<&ConnectionMetrics>) -> String {
        if let Some(pinned) = &self.config.strategy {
            return pinned.clone();
        }

        let s = &self.state;
        let degraded = connection.is_some_and(|c| {
            c.connection_health != ConnectionHealth::Healthy || c.error_rate_percent > 20.0
        });

        let name = if s.constraint_error_count > 2 * s.timeout_count {
            CONSTRAINT_FOCUSED
        } else if degraded {
            CONSERVATIVE
        } else if s.timeout_count > 3 || s.consecutive_failures > 2 {
            AGGRESSIVE
        } else {
            CONSERVATIVE
        };
        name.to_string()
    }

    /// Decide the next batch from the outcome of the last one.
    pub fn make_decision(
        &mut self,
        last: &BatchResult,
        connection: Option<&ConnectionMetrics>,
        remaining_records: usize,
    ) -> BatchDecision {
        let selected = self.select_strategy(connection);
        if selected != self.state.strategy {
            info!(from = %self.state.strategy, to = %selected, "Switching reduction strategy");
            self.state.strategy = selected;
        }
        let strategy = self
            .strategies
            .get(&self.state.strategy)
            .cloned()
            .unwrap_or_else(conservative);

        let mut decision = if last.success {
            self.on_success(&strategy, last, remaining_records)
        } else {
            self.on_failure(&strategy, last, remaining_records)
        };

        decision.batch_size = decision.batch_size.min(remaining_records);
        metrics::set_batch_size(self.state.current_batch_size);
        decision
    }

    fn on_success(
        &mut self,
        strategy: &ReductionStrategy,
        last: &BatchResult,
        remaining: usize,
    ) -> BatchDecision {
        let s = &mut self.state;
        s.consecutive_failures = 0;
        s.consecutive_successes += 1;

        let mut reasoning = format!(
            "Batch succeeded ({} in a row), keeping size {}",
            s.consecutive_successes, s.current_batch_size
        );

        if s.consecutive_successes >= SUCCESS_STREAK_FOR_GROWTH
            && last.processing_time_ms < self.config.growth_processing_limit_ms
        {
            let current = s.current_batch_size;
            let half_remaining = remaining.div_ceil(2).max(current);
            let grown = ((current as f64 * GROWTH_FACTOR).ceil() as usize)
                .min(s.original_batch_size)
                .min(half_remaining);
            if grown > current {
                s.current_batch_size = grown;
                reasoning = format!(
                    "{} consecutive fast successes, growing batch {} -> {}",
                    s.consecutive_successes, current, grown
                );
                debug!(from = current, to = grown, "Growing batch size");
            }
            s.consecutive_successes = 0;
        }

        BatchDecision {
            batch_size: s.current_batch_size,
            delay_ms: self.config.base_delay_ms,
            should_retry: false,
            should_use_individual_records: s.current_batch_size == 1
                && strategy.allow_individual_fallback,
            reasoning,
            confidence: Confidence::High,
            expected_success_rate: SUCCESS_EXPECTATION,
            strategy: strategy.name.clone(),
            stage: s.current_stage,
        }
    }

    fn on_failure(
        &mut self,
        strategy: &ReductionStrategy,
        last: &BatchResult,
        remaining: usize,
    ) -> BatchDecision {
        let kind = classify(last.error.as_ref());
        let s = &mut self.state;
        s.consecutive_successes = 0;
        s.consecutive_failures += 1;
        match kind {
            ErrorKind::Timeout => s.timeout_count += 1,
            ErrorKind::Constraint => s.constraint_error_count += 1,
            ErrorKind::Memory => s.memory_error_count += 1,
            ErrorKind::Network => s.network_error_count += 1,
            ErrorKind::Unknown => {}
        }

        let stage = strategy.stage(s.current_stage);
        let trigger_matched = match stage.trigger_condition {
            TriggerCondition::Timeout => kind == ErrorKind::Timeout,
            TriggerCondition::Constraint => kind == ErrorKind::Constraint,
            TriggerCondition::Memory => kind == ErrorKind::Memory,
            TriggerCondition::ConsecutiveFailures => s.consecutive_failures >= 2,
        };
        let should_reduce = trigger_matched
            || last.retry_count >= stage.retry_limit
            || s.consecutive_failures >= FAILURE_STREAK_FOR_REDUCTION;

        if should_reduce && s.total_reductions < strategy.max_reduction_attempts {
            self.reduce(strategy, kind, remaining)
        } else {
            self.hold(strategy, kind, last.retry_count)
        }
    }

    fn reduce(
        &mut self,
        strategy: &ReductionStrategy,
        kind: ErrorKind,
        remaining: usize,
    ) -> BatchDecision {
        let now = self.clock.now_ms();
        let s = &mut self.state;

        let next_stage = (s.current_stage + 1)
            .min(strategy.last_stage())
            .max(s.current_stage);
        let stage = strategy.stage(next_stage);

        let from = s.current_batch_size;
        let cut = from * stage.reduction_percentage as usize / 100;
        let to = (from - cut)
            .max(1)
            .max(stage.batch_size)
            .min(from)
            .min(remaining.max(1));

        let reason = format!("{} error at stage {}", kind, next_stage);
        s.current_stage = next_stage;
        s.current_batch_size = to;
        s.total_reductions += 1;
        s.last_reduction_reason = Some(reason.clone());
        s.reduction_history.push(ReductionRecord {
            timestamp_ms: now,
            from_size: from,
            to_size: to,
            reason: reason.clone(),
            stage: next_stage,
        });

        info!(
            from_size = from,
            to_size = to,
            stage = next_stage,
            strategy = %strategy.name,
            reason = %reason,
            "Reducing batch size"
        );
        metrics::record_batch_reduction(kind.as_str());

        let individual = to == 1 && strategy.allow_individual_fallback;
        BatchDecision {
            batch_size: to,
            delay_ms: (self.config.base_delay_ms as f64 * stage.delay_multiplier) as u64,
            should_retry: true,
            should_use_individual_records: individual,
            reasoning: format!(
                "{} error, stage {} ({}): batch {} -> {}",
                kind, next_stage, stage.description, from, to
            ),
            confidence: Confidence::Medium,
            expected_success_rate: expected_success_rate(to, kind, next_stage),
            strategy: strategy.name.clone(),
            stage: next_stage,
        }
    }

    fn hold(&mut self, strategy: &ReductionStrategy, kind: ErrorKind, retry_count: u32) -> BatchDecision {
        let s = &mut self.state;
        let stage = strategy.stage(s.current_stage);

        if s.total_reductions >= strategy.max_reduction_attempts
            && strategy.allow_individual_fallback
        {
            s.current_batch_size = 1;
            return BatchDecision {
                batch_size: 1,
                delay_ms: (self.config.base_delay_ms as f64 * stage.delay_multiplier) as u64,
                should_retry: true,
                should_use_individual_records: true,
                reasoning: format!(
                    "Reduction limit of {} reached, processing records individually",
                    strategy.max_reduction_attempts
                ),
                confidence: Confidence::Medium,
                expected_success_rate: expected_success_rate(1, kind, s.current_stage),
                strategy: strategy.name.clone(),
                stage: s.current_stage,
            };
        }

        let backoff = (1.5 + retry_count as f64 * 0.5).min(5.0);
        BatchDecision {
            batch_size: s.current_batch_size,
            delay_ms: (self.config.base_delay_ms as f64 * backoff) as u64,
            should_retry: retry_count < stage.retry_limit,
            should_use_individual_records: false,
            reasoning: format!(
                "{} error did not trigger a reduction, retrying {} records (attempt {})",
                kind,
                s.current_batch_size,
                retry_count + 1
            ),
            confidence: Confidence::Low,
            expected_success_rate: expected_success_rate(s.current_batch_size, kind, s.current_stage),
            strategy: strategy.name.clone(),
            stage: s.current_stage,
        }
    }

    /// Summarize reductions made so far in this session.
    #[must_use]
    pub fn reduction_summary(&self) -> ReductionSummary {
        let s = &self.state;
        let reduction_percent = if s.original_batch_size == 0 {
            0.0
        } else {
            (s.original_batch_size - s.current_batch_size) as f64 * 100.0
                / s.original_batch_size as f64
        };
        let milestones = s
            .reduction_history
            .iter()
            .filter(|r| {
                r.from_size.saturating_sub(r.to_size) >= 10 || (r.to_size == 1 && r.from_size > 1)
            })
            .cloned()
            .collect();

        let effectiveness = if s.consecutive_successes >= SUCCESS_STREAK_FOR_GROWTH {
            Effectiveness::Effective
        } else if s.consecutive_successes > 0 {
            Effectiveness::Improving
        } else if s.consecutive_failures >= FAILURE_STREAK_FOR_REDUCTION {
            Effectiveness::Failing
        } else if s.consecutive_failures > 0 {
            Effectiveness::Struggling
        } else {
            Effectiveness::Untested
        };

        ReductionSummary {
            strategy: s.strategy.clone(),
            original_batch_size: s.original_batch_size,
            current_batch_size: s.current_batch_size,
            reduction_percent,
            current_stage: s.current_stage,
            total_reductions: s.total_reductions,
            milestones,
            effectiveness,
            last_reduction_reason: s.last_reduction_reason.clone(),
        }
    }
}

/// Heuristic chance that the next batch succeeds.
fn expected_success_rate(batch_size: usize, kind: ErrorKind, stage: usize) -> f64 {
    let mut rate: f64 = 70.0;
    if batch_size <= 5 {
        rate += 20.0;
    } else if batch_size <= 15 {
        rate += 10.0;
    } else if batch_size > 50 {
        rate -= 20.0;
    }

    match kind {
        ErrorKind::Timeout => rate -= 5.0 * stage as f64,
        ErrorKind::Constraint => rate += if batch_size <= 5 { 10.0 } else { -10.0 },
        ErrorKind::Memory => rate -= batch_size as f64 / 10.0,
        ErrorKind::Network => rate -= 5.0,
        ErrorKind::Unknown => {}
    }

    rate.clamp(5.0, 95.0)
}
