//! The upload loop: check, size, write, report, wait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batching::classify::{classify, BatchError, ErrorKind};
use crate::batching::reducer::{BatchResult, ProgressiveBatchReducer, ReductionSummary};
use crate::clock::{Clock, TokioClock};
use crate::config::validation::validate_pipeline;
use crate::config::{ConfigError, PipelineConfig, UploadConfig};
use crate::observability::metrics;
use crate::pipeline::sink::BatchSink;
use crate::resilience::circuit_breaker::{
    AlternativeAction, CircuitBreaker, CircuitMetrics, CircuitState,
};
use crate::resilience::health::{ConnectionHealth, SystemHealth};

const OUTCOME_WINDOW: usize = 20;

/// Why an upload stopped before every record was handled.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload abandoned after {refusals} circuit refusals without a successful write: {reason}")]
    CircuitOpen {
        reason: String,
        refusals: u32,
        uploaded: usize,
    },

    #[error("batch at offset {offset} failed after {attempts} attempts: {source}")]
    Exhausted {
        offset: usize,
        attempts: u32,
        uploaded: usize,
        #[source]
        source: BatchError,
    },
}

/// Outcome of one upload session.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub session_id: Uuid,
    pub total_records: usize,
    pub records_uploaded: usize,
    /// Single records abandoned after repeated failures.
    pub records_failed: usize,
    pub batches_attempted: u64,
    pub refusals: u64,
    pub elapsed_ms: u64,
    pub circuit_state: CircuitState,
    pub circuit: CircuitMetrics,
    pub reduction: ReductionSummary,
}

/// Rolling view of recent outcomes, turned into a health snapshot.
#[derive(Debug, Default)]
struct Observations {
    recent: VecDeque<Option<ErrorKind>>,
    consecutive_failures: u32,
    consecutive_network_failures: u32,
    last_response_ms: u64,
    memory_pressure: bool,
}

impl Observations {
    fn record(&mut self, outcome: Option<ErrorKind>, response_ms: u64) {
        self.last_response_ms = response_ms;
        match outcome {
            None => {
                self.consecutive_failures = 0;
                self.consecutive_network_failures = 0;
                self.memory_pressure = false;
            }
            Some(kind) => {
                self.consecutive_failures += 1;
                if kind == ErrorKind::Network {
                    self.consecutive_network_failures += 1;
                }
                if kind == ErrorKind::Memory {
                    self.memory_pressure = true;
                }
            }
        }
        self.recent.push_back(outcome);
        if self.recent.len() > OUTCOME_WINDOW {
            self.recent.pop_front();
        }
    }

    fn snapshot(&self) -> SystemHealth {
        let total = self.recent.len();
        let failures: Vec<ErrorKind> = self.recent.iter().flatten().copied().collect();
        let share = |kind: ErrorKind| {
            if failures.is_empty() {
                0.0
            } else {
                failures.iter().filter(|k| **k == kind).count() as f64 / failures.len() as f64
            }
        };

        SystemHealth {
            connection_health: match self.consecutive_network_failures {
                0 => ConnectionHealth::Healthy,
                1 | 2 => ConnectionHealth::Degraded,
                _ => ConnectionHealth::Critical,
            },
            response_time_ms: self.last_response_ms,
            error_rate_percent: if total == 0 {
                0.0
            } else {
                failures.len() as f64 / total as f64 * 100.0
            },
            memory_pressure: self.memory_pressure,
            consecutive_failures: self.consecutive_failures,
            timeout_rate: share(ErrorKind::Timeout),
            constraint_violation_rate: share(ErrorKind::Constraint),
        }
    }
}

/// Drives one sink through the breaker and reducer.
///
/// The pipeline owns its controllers, so each pipeline is an independent
/// session. Waits are `tokio::time::sleep` calls capped at `max_wait_ms`.
pub struct UploadPipeline<S> {
    sink: S,
    breaker: CircuitBreaker,
    reducer: ProgressiveBatchReducer,
    config: PipelineConfig,
    initial_batch_size: usize,
}

impl<S> UploadPipeline<S> {
    pub fn new(sink: S, config: &UploadConfig) -> Result<Self, ConfigError> {
        Self::with_clock(sink, config, Arc::new(TokioClock::new()))
    }

    pub fn with_clock(
        sink: S,
        config: &UploadConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        validate_pipeline(&config.pipeline).map_err(ConfigError::Validation)?;
        let breaker = CircuitBreaker::with_clock("upload", config.breaker.clone(), clock.clone())?;
        let reducer = ProgressiveBatchReducer::with_clock(config.batching.clone(), clock)?;

        Ok(Self {
            sink,
            breaker,
            reducer,
            config: config.pipeline.clone(),
            initial_batch_size: config.batching.initial_batch_size,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Mutable access, e.g. to register state-change listeners.
    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    pub fn reducer(&self) -> &ProgressiveBatchReducer {
        &self.reducer
    }

    pub fn reducer_mut(&mut self) -> &mut ProgressiveBatchReducer {
        &mut self.reducer
    }

    async fn wait(&self, delay_ms: u64) {
        let delay = delay_ms.min(self.config.max_wait_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Upload every record, in order.
    ///
    /// Returns a report when every record was either stored or, in
    /// single-record mode, abandoned after `max_batch_attempts`. Failures of
    /// recovery attempts, and failures that open the circuit, are not charged
    /// to the records; an outage ends with `CircuitOpen` once `max_refusals`
    /// refusals pass without a successful write.
    pub async fn upload<R>(&mut self, records: &[R]) -> Result<UploadReport, UploadError>
    where
        S: BatchSink<R>,
    {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        self.reducer.reset(self.initial_batch_size);

        let mut observations = Observations::default();
        let mut offset = 0;
        let mut uploaded = 0;
        let mut failed = 0;
        let mut batches: u64 = 0;
        let mut total_refusals: u64 = 0;
        let mut refusals: u32 = 0;
        let mut attempts: u32 = 0;
        let mut next_size = self.initial_batch_size.min(records.len()).max(1);
        let mut individual = false;

        info!(
            session = %session_id,
            records = records.len(),
            batch_size = next_size,
            "Upload session started"
        );

        while offset < records.len() {
            let health = observations.snapshot();
            let decision = self.breaker.check_request(Some(&health));

            if !decision.allow_request && !decision.recovery_ready {
                refusals += 1;
                total_refusals += 1;
                if refusals >= self.config.max_refusals {
                    warn!(
                        session = %session_id,
                        refusals,
                        reason = %decision.reason,
                        "Giving up on upload"
                    );
                    return Err(UploadError::CircuitOpen {
                        reason: decision.reason,
                        refusals,
                        uploaded,
                    });
                }
                debug!(
                    reason = %decision.reason,
                    delay_ms = decision.suggested_delay_ms,
                    "Request refused"
                );
                self.wait(decision.suggested_delay_ms.max(1)).await;
                continue;
            }
            self.wait(decision.suggested_delay_ms).await;

            let single = decision.recovery_ready
                || individual
                || decision.alternative_action == Some(AlternativeAction::IndividualProcessing);
            let size = (if single { 1 } else { next_size })
                .min(records.len() - offset)
                .max(1);
            let chunk = &records[offset..offset + size];

            let write_started = Instant::now();
            let outcome = self.sink.write(chunk).await;
            let elapsed_ms = write_started.elapsed().as_millis() as u64;
            batches += 1;

            let mut circuit_tripped = false;
            let result = match outcome {
                Ok(()) => {
                    self.breaker.record_result(true, elapsed_ms, None);
                    refusals = 0;
                    observations.record(None, elapsed_ms);
                    offset += size;
                    uploaded += size;
                    attempts = 0;
                    metrics::record_records("uploaded", size);
                    BatchResult::success(elapsed_ms)
                }
                Err(error) => {
                    let kind = classify(Some(&error));
                    self.breaker.record_result(false, elapsed_ms, Some(kind.into()));
                    circuit_tripped = self.breaker.state() == CircuitState::Open;
                    observations.record(Some(kind), elapsed_ms);
                    debug!(offset, size, error = %error, kind = %kind, "Batch write failed");
                    BatchResult::failure(error, elapsed_ms, attempts)
                }
            };

            let batch = self.reducer.make_decision(
                &result,
                Some(&observations.snapshot()),
                records.len() - offset,
            );

            if let Some(error) = result.error {
                if decision.recovery_ready || circuit_tripped {
                    // store-wide outage: the refusal limit decides, not these records
                    debug!(offset, "Failure charged to the circuit, not the batch");
                } else if batch.batch_size < size {
                    // a smaller batch starts its own attempt count
                    attempts = 0;
                } else {
                    attempts += 1;
                    if !batch.should_retry || attempts >= self.config.max_batch_attempts {
                        if size > 1 {
                            return Err(UploadError::Exhausted {
                                offset,
                                attempts,
                                uploaded,
                                source: error,
                            });
                        }
                        warn!(offset, attempts, error = %error, "Abandoning record");
                        metrics::record_records("failed", 1);
                        offset += 1;
                        failed += 1;
                        attempts = 0;
                    }
                }
            }

            individual = batch.should_use_individual_records;
            next_size = batch.batch_size.max(1);
            self.wait(batch.delay_ms).await;
        }

        let report = UploadReport {
            session_id,
            total_records: records.len(),
            records_uploaded: uploaded,
            records_failed: failed,
            batches_attempted: batches,
            refusals: total_refusals,
            elapsed_ms: started.elapsed().as_millis() as u64,
            circuit_state: self.breaker.state(),
            circuit: self.breaker.metrics(),
            reduction: self.reducer.reduction_summary(),
        };
        info!(
            session = %session_id,
            uploaded = report.records_uploaded,
            failed = report.records_failed,
            batches = report.batches_attempted,
            "Upload session finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_observations() {
        let mut obs = Observations::default();
        obs.record(None, 100);
        obs.record(Some(ErrorKind::Timeout), 30_000);
        obs.record(Some(ErrorKind::Network), 50);
        obs.record(Some(ErrorKind::Network), 50);

        let health = obs.snapshot();
        assert_eq!(health.connection_health, ConnectionHealth::Degraded);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.error_rate_percent, 75.0);
        assert!((health.timeout_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(health.response_time_ms, 50);

        obs.record(Some(ErrorKind::Network), 50);
        assert_eq!(obs.snapshot().connection_health, ConnectionHealth::Critical);

        obs.record(None, 10);
        let health = obs.snapshot();
        assert_eq!(health.connection_health, ConnectionHealth::Healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_outcome_window_is_bounded() {
        let mut obs = Observations::default();
        for _ in 0..(OUTCOME_WINDOW + 5) {
            obs.record(Some(ErrorKind::Memory), 10);
        }
        assert_eq!(obs.recent.len(), OUTCOME_WINDOW);
        assert!(obs.snapshot().memory_pressure);
    }

    #[test]
    fn test_rejects_invalid_pipeline_config() {
        let mut config = UploadConfig::default();
        config.pipeline.max_batch_attempts = 0;
        let result = UploadPipeline::new(crate::pipeline::sink::MemorySink::<u32>::new(), &config);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
