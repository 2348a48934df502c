//! Adaptive circuit breaker for bulk uploads.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: store assumed unhealthy, requests refused until the cooldown ends
//! - Half-Open: a few trial requests test whether the store recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: weighted failures since max(now - window, last transition) >= threshold
//! Open → Half-Open: first record_result() after cooldown_end_time
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Ordering
//! `check_request()` never changes state. Once the cooldown has elapsed it keeps
//! refusing but sets `recovery_ready`; the caller then sends one probe and
//! reports it through `record_result()`, which performs the Open → Half-Open
//! transition before accounting for the probe's outcome.
//!
//! # Concurrency
//! All mutating methods take `&mut self`. One breaker belongs to one upload
//! session; callers that need several sessions create several breakers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::{self, Clock};
use crate::config::validation::validate_breaker;
use crate::config::{BreakerConfig, BreakerConfigUpdate, ConfigError};
use crate::observability::metrics;
use crate::resilience::health::{health_score, ConnectionHealth, SystemHealth};

const MAX_HISTORY: usize = 1000;
const SUMMARY_WINDOW: usize = 50;
const MAX_MULTIPLIER: f64 = 3.0;
const MIN_MULTIPLIER: f64 = 0.5;
const MAX_OPEN_DELAY_MS: u64 = 30_000;
const PROACTIVE_DELAY_MS: u64 = 1_000;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Classification of a failed request, used to weight it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    Memory,
    Other,
}

impl FailureKind {
    /// Contribution of one failure of this kind to the failure count.
    pub fn weight(self) -> f64 {
        match self {
            Self::Timeout => 1.5,
            Self::Connection => 2.0,
            Self::Memory => 1.8,
            Self::Other => 1.0,
        }
    }
}

/// What the caller could do instead of sending the next request as planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlternativeAction {
    ReduceBatchSize,
    IndividualProcessing,
    PauseUpload,
    ChangeStrategy,
}

/// Answer to [`CircuitBreaker::check_request`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allow_request: bool,
    pub reason: String,
    /// Advisory wait before the next action, in milliseconds.
    pub suggested_delay_ms: u64,
    pub alternative_action: Option<AlternativeAction>,
    pub system_health_score: f64,
    /// Open and cooled down: the next reported result moves the circuit to half-open.
    pub recovery_ready: bool,
}

/// One recorded request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RequestRecord {
    pub timestamp_ms: u64,
    pub success: bool,
    pub response_time_ms: u64,
    /// Failure weight; zero for successes.
    pub weight: f64,
}

/// Counters and timestamps describing the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: f64,
    pub success_count: u32,
    pub total_requests: u64,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    pub state_change_time: u64,
    pub cooldown_end_time: Option<u64>,
    pub current_threshold: u32,
    pub adaptive_multiplier: f64,
}

/// Notification delivered to state-change listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub timestamp_ms: u64,
}

/// Handle returned by [`CircuitBreaker::on_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Derived view over the recent request history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub state: CircuitState,
    pub failure_rate_percent: f64,
    pub average_response_time_ms: f64,
    pub total_requests: u64,
    pub current_threshold: u32,
    pub adaptive_multiplier: f64,
    pub recommendation: String,
}

/// A named, adaptive circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    metrics: CircuitMetrics,
    history: VecDeque<RequestRecord>,
    last_connection_health: Option<ConnectionHealth>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .field("history_len", &self.history.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, clock::system())
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        validate_breaker(&config).map_err(ConfigError::Validation)?;
        let now = clock.now_ms();
        let name = name.into();
        metrics::set_circuit_state(&name, CircuitState::Closed as u8);

        Ok(Self {
            name,
            metrics: CircuitMetrics {
                state: CircuitState::Closed,
                failure_count: 0.0,
                success_count: 0,
                total_requests: 0,
                last_failure_time: None,
                last_success_time: None,
                state_change_time: now,
                cooldown_end_time: None,
                current_threshold: config.failure_threshold,
                adaptive_multiplier: 1.0,
            },
            config,
            history: VecDeque::new(),
            last_connection_health: None,
            listeners: Vec::new(),
            next_listener_id: 0,
            clock,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.metrics.state
    }

    /// Decide whether the caller should attempt its next operation.
    ///
    /// The snapshot (if any) also feeds the adaptive threshold.
    pub fn check_request(&mut self, health: Option<&SystemHealth>) -> Decision {
        let now = self.clock.now_ms();
        let score = health_score(health);
        if let Some(h) = health {
            self.last_connection_health = Some(h.connection_health);
        }
        self.recompute_threshold();

        match self.metrics.state {
            CircuitState::Closed => {
                let consecutive = health.map_or(0, |h| h.consecutive_failures);
                if score < 30.0 || consecutive > 3 {
                    debug!(
                        circuit = %self.name,
                        score,
                        consecutive_failures = consecutive,
                        "Degraded health while closed, recommending smaller batches"
                    );
                    Decision {
                        allow_request: true,
                        reason: format!(
                            "Circuit closed - degraded health (score {:.0}), reduce load",
                            score
                        ),
                        suggested_delay_ms: PROACTIVE_DELAY_MS,
                        alternative_action: Some(AlternativeAction::ReduceBatchSize),
                        system_health_score: score,
                        recovery_ready: false,
                    }
                } else {
                    Decision {
                        allow_request: true,
                        reason: "Circuit closed - normal operation".to_string(),
                        suggested_delay_ms: 0,
                        alternative_action: None,
                        system_health_score: score,
                        recovery_ready: false,
                    }
                }
            }
            CircuitState::Open => {
                let cooldown_end = self.metrics.cooldown_end_time.unwrap_or(now);
                if now < cooldown_end {
                    let remaining = cooldown_end - now;
                    let timeout_rate = health.map_or(0.0, |h| h.timeout_rate);
                    let action = if score < 20.0 {
                        AlternativeAction::PauseUpload
                    } else if timeout_rate > 0.5 {
                        AlternativeAction::IndividualProcessing
                    } else {
                        AlternativeAction::ChangeStrategy
                    };
                    Decision {
                        allow_request: false,
                        reason: format!(
                            "Circuit open - cooldown in progress ({}s remaining)",
                            remaining.div_ceil(1000)
                        ),
                        suggested_delay_ms: remaining.min(MAX_OPEN_DELAY_MS),
                        alternative_action: Some(action),
                        system_health_score: score,
                        recovery_ready: false,
                    }
                } else {
                    Decision {
                        allow_request: false,
                        reason: "Circuit open - cooldown elapsed, ready for recovery attempt"
                            .to_string(),
                        suggested_delay_ms: 0,
                        alternative_action: Some(AlternativeAction::IndividualProcessing),
                        system_health_score: score,
                        recovery_ready: true,
                    }
                }
            }
            CircuitState::HalfOpen => {
                let window_start = now.saturating_sub(self.config.half_open_window_ms);
                let opened_at = self.metrics.state_change_time;
                let recent: Vec<u64> = self
                    .history
                    .iter()
                    .filter(|r| r.timestamp_ms > window_start && r.timestamp_ms >= opened_at)
                    .map(|r| r.timestamp_ms)
                    .collect();

                if recent.len() as u32 >= self.config.half_open_max_requests {
                    let oldest = recent.iter().copied().min().unwrap_or(now);
                    let wait = (oldest + self.config.half_open_window_ms).saturating_sub(now);
                    Decision {
                        allow_request: false,
                        reason: format!(
                            "Circuit half-open - trial limit of {} reached",
                            self.config.half_open_max_requests
                        ),
                        suggested_delay_ms: wait.max(1),
                        alternative_action: Some(AlternativeAction::IndividualProcessing),
                        system_health_score: score,
                        recovery_ready: false,
                    }
                } else {
                    let cautious = score < 40.0;
                    Decision {
                        allow_request: true,
                        reason: if cautious {
                            "Circuit half-open - trial request, poor health".to_string()
                        } else {
                            "Circuit half-open - trial request".to_string()
                        },
                        suggested_delay_ms: 0,
                        alternative_action: cautious
                            .then_some(AlternativeAction::IndividualProcessing),
                        system_health_score: score,
                        recovery_ready: false,
                    }
                }
            }
        }
    }

    /// Report the outcome of an operation.
    pub fn record_result(
        &mut self,
        success: bool,
        response_time_ms: u64,
        failure_kind: Option<FailureKind>,
    ) {
        let now = self.clock.now_ms();

        if self.metrics.state == CircuitState::Open
            && self.metrics.cooldown_end_time.is_some_and(|end| now >= end)
        {
            self.transition(CircuitState::HalfOpen, "cooldown elapsed, testing recovery");
        }

        let weight = if success {
            0.0
        } else {
            failure_kind.unwrap_or(FailureKind::Other).weight()
        };
        self.history.push_back(RequestRecord {
            timestamp_ms: now,
            success,
            response_time_ms,
            weight,
        });
        self.prune_history(now);
        self.metrics.total_requests += 1;

        if success {
            metrics::record_request_outcome(&self.name, "success");
            self.handle_success(now);
        } else {
            metrics::record_request_outcome(&self.name, "failure");
            self.handle_failure(now, weight);
        }
    }

    fn handle_success(&mut self, now: u64) {
        self.metrics.last_success_time = Some(now);
        self.metrics.success_count += 1;

        match self.metrics.state {
            CircuitState::Closed => {
                if self.config.enable_adaptive_thresholds && self.metrics.success_count % 10 == 0 {
                    self.metrics.adaptive_multiplier =
                        (self.metrics.adaptive_multiplier * 0.95).max(MIN_MULTIPLIER);
                }
            }
            CircuitState::HalfOpen => {
                if self.metrics.success_count >= self.config.success_threshold {
                    let reason = format!(
                        "{} successful trial requests",
                        self.metrics.success_count
                    );
                    self.transition(CircuitState::Closed, &reason);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn handle_failure(&mut self, now: u64, weight: f64) {
        self.metrics.last_failure_time = Some(now);
        self.metrics.failure_count += weight;
        if self.config.enable_adaptive_thresholds {
            self.metrics.adaptive_multiplier =
                (self.metrics.adaptive_multiplier * 1.1).min(MAX_MULTIPLIER);
        }

        match self.metrics.state {
            CircuitState::Closed => {
                let in_window = self.weighted_failures_in_window(now);
                let threshold = self.metrics.current_threshold as f64;
                if in_window >= threshold {
                    let reason = format!(
                        "failure threshold reached ({:.1} >= {})",
                        in_window, self.metrics.current_threshold
                    );
                    self.transition(CircuitState::Open, &reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open, "failure during recovery trial");
            }
            CircuitState::Open => {}
        }
    }

    fn weighted_failures_in_window(&self, now: u64) -> f64 {
        let since = now
            .saturating_sub(self.config.time_window_ms)
            .max(self.metrics.state_change_time);
        self.history
            .iter()
            .filter(|r| !r.success && r.timestamp_ms >= since)
            .map(|r| r.weight)
            .sum()
    }

    fn prune_history(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.config.time_window_ms.saturating_mul(2));
        while self
            .history
            .front()
            .is_some_and(|r| r.timestamp_ms < horizon)
        {
            self.history.pop_front();
        }
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    fn recompute_threshold(&mut self) {
        let configured = self.config.failure_threshold.max(1);
        if !self.config.enable_adaptive_thresholds {
            self.metrics.current_threshold = configured;
            return;
        }

        let base = ((configured as f64 * self.metrics.adaptive_multiplier).round() as u32).max(1);
        let adjusted = match self.last_connection_health {
            Some(ConnectionHealth::Critical) => ((base as f64 * 0.5).round() as u32).max(1),
            Some(ConnectionHealth::Degraded) => {
                ((base as f64 * 0.7).round() as u32).max(2).min(base)
            }
            _ => base,
        };
        self.metrics.current_threshold = adjusted.max(1);
    }

    /// Single entry point for every state change.
    fn transition(&mut self, to: CircuitState, reason: &str) {
        let from = self.metrics.state;
        if from == to {
            return;
        }
        let now = self.clock.now_ms();

        self.metrics.state = to;
        self.metrics.state_change_time = now;
        match to {
            CircuitState::Open => {
                let cooldown = ((self.config.recovery_time_ms as f64
                    * self.metrics.adaptive_multiplier) as u64)
                    .min(self.config.max_cooldown_ms);
                self.metrics.cooldown_end_time = Some(now + cooldown);
                self.metrics.success_count = 0;
                warn!(
                    circuit = %self.name,
                    %from,
                    failure_count = self.metrics.failure_count,
                    threshold = self.metrics.current_threshold,
                    cooldown_ms = cooldown,
                    reason,
                    "Circuit breaker opened"
                );
            }
            CircuitState::Closed => {
                self.metrics.failure_count = 0.0;
                self.metrics.success_count = 0;
                self.metrics.cooldown_end_time = None;
                info!(circuit = %self.name, %from, reason, "Circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                self.metrics.failure_count = 0.0;
                self.metrics.success_count = 0;
                info!(circuit = %self.name, %from, reason, "Circuit breaker half-open");
            }
        }

        metrics::set_circuit_state(&self.name, to as u8);
        metrics::record_circuit_transition(&self.name, &from.to_string(), &to.to_string());

        let event = StateChange {
            circuit: self.name.clone(),
            from,
            to,
            reason: reason.to_string(),
            timestamp_ms: now,
        };
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(circuit = %self.name, listener = id.0, "State change listener panicked");
            }
        }
    }

    /// Open the circuit regardless of the failure count.
    pub fn force_open(&mut self, reason: &str) {
        let reason = format!("forced open: {}", reason);
        self.transition(CircuitState::Open, &reason);
    }

    /// Close the circuit regardless of the trial count.
    pub fn force_close(&mut self, reason: &str) {
        let reason = format!("forced closed: {}", reason);
        self.transition(CircuitState::Closed, &reason);
    }

    /// Return to a fresh closed breaker, keeping config and listeners.
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed, "reset");
        self.history.clear();
        self.last_connection_health = None;
        self.metrics.failure_count = 0.0;
        self.metrics.success_count = 0;
        self.metrics.total_requests = 0;
        self.metrics.last_failure_time = None;
        self.metrics.last_success_time = None;
        self.metrics.cooldown_end_time = None;
        self.metrics.adaptive_multiplier = 1.0;
        self.metrics.current_threshold = self.config.failure_threshold;
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        self.metrics.clone()
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Recorded outcomes, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RequestRecord> {
        self.history.iter()
    }

    /// Apply a partial config update. Nothing changes if the result is invalid.
    pub fn update_config(&mut self, update: &BreakerConfigUpdate) -> Result<(), ConfigError> {
        let merged = self.config.merged(update);
        validate_breaker(&merged).map_err(ConfigError::Validation)?;
        self.config = merged;
        self.recompute_threshold();
        info!(circuit = %self.name, config = ?self.config, "Circuit breaker config updated");
        Ok(())
    }

    /// Register a listener. Listeners run synchronously on every transition.
    pub fn on_state_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_state_change_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Summarize the last 50 recorded requests.
    #[must_use]
    pub fn health_summary(&self) -> HealthSummary {
        let recent: Vec<&RequestRecord> =
            self.history.iter().rev().take(SUMMARY_WINDOW).collect();
        let (failure_rate, avg_response) = if recent.is_empty() {
            (0.0, 0.0)
        } else {
            let failures = recent.iter().filter(|r| !r.success).count() as f64;
            let total_time: u64 = recent.iter().map(|r| r.response_time_ms).sum();
            (
                failures / recent.len() as f64 * 100.0,
                total_time as f64 / recent.len() as f64,
            )
        };

        let recommendation = match self.metrics.state {
            CircuitState::Closed if failure_rate > 20.0 => {
                "Elevated failure rate - consider reducing batch size"
            }
            CircuitState::Closed => "System healthy - normal operation",
            CircuitState::Open => "Circuit open - wait for cooldown before retrying",
            CircuitState::HalfOpen => "Testing recovery - use small batches or individual records",
        };

        HealthSummary {
            state: self.metrics.state,
            failure_rate_percent: failure_rate,
            average_response_time_ms: avg_response,
            total_requests: self.metrics.total_requests,
            current_threshold: self.metrics.current_threshold,
            adaptive_multiplier: self.metrics.adaptive_multiplier,
            recommendation: recommendation.to_string(),
        }
    }
}
