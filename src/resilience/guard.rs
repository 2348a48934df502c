//! Check → call → report composition around a [`CircuitBreaker`].
//!
//! Controllers never fail on their own; this helper is the one place a refusal
//! becomes an error, for callers that would rather get `Err` than inspect a
//! [`Decision`](crate::resilience::circuit_breaker::Decision).

use std::future::Future;
use std::time::Instant;

use crate::resilience::circuit_breaker::{CircuitBreaker, FailureKind};
use crate::resilience::health::SystemHealth;

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    /// The breaker refused the call.
    #[error("Circuit breaker open: {reason}")]
    Open { reason: String, suggested_delay_ms: u64 },

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Run `operation` if the breaker allows it and report the outcome.
///
/// `classify` maps an operation error to the failure weight class.
pub async fn with_circuit_breaker<F, Fut, T, E, C>(
    breaker: &mut CircuitBreaker,
    health: Option<&SystemHealth>,
    classify: C,
    operation: F,
) -> Result<T, GuardError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnOnce(&E) -> FailureKind,
{
    let decision = breaker.check_request(health);
    if !decision.allow_request {
        return Err(GuardError::Open {
            reason: decision.reason,
            suggested_delay_ms: decision.suggested_delay_ms,
        });
    }

    let started = Instant::now();
    let result = operation().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(value) => {
            breaker.record_result(true, elapsed_ms, None);
            Ok(value)
        }
        Err(e) => {
            breaker.record_result(false, elapsed_ms, Some(classify(&e)));
            Err(GuardError::Inner(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BreakerConfig;
    use crate::resilience::circuit_breaker::CircuitState;

    fn test_breaker() -> CircuitBreaker {
        let config = BreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        CircuitBreaker::with_clock("guard", config, ManualClock::new(0)).unwrap()
    }

    #[tokio::test]
    async fn test_passes_successful_calls() {
        let mut cb = test_breaker();

        let result: Result<i32, GuardError<&str>> =
            with_circuit_breaker(&mut cb, None, |_| FailureKind::Other, || async { Ok(42) })
                .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.metrics().total_requests, 1);
    }

    #[tokio::test]
    async fn test_failures_trip_and_then_reject() {
        let mut cb = test_breaker();

        for _ in 0..2 {
            let result: Result<i32, GuardError<&str>> = with_circuit_breaker(
                &mut cb,
                None,
                |_| FailureKind::Other,
                || async { Err("down") },
            )
            .await;
            assert!(matches!(result, Err(GuardError::Inner("down"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let mut called = false;
        let result: Result<i32, GuardError<&str>> =
            with_circuit_breaker(&mut cb, None, |_| FailureKind::Other, || {
                called = true;
                async { Ok(1) }
            })
            .await;

        assert!(!called);
        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("Circuit breaker open: Circuit open - cooldown"));
    }

    #[tokio::test]
    async fn test_classifier_weights_failure() {
        let mut cb = test_breaker();

        let _: Result<(), GuardError<&str>> = with_circuit_breaker(
            &mut cb,
            None,
            |_| FailureKind::Connection,
            || async { Err("connection reset") },
        )
        .await;

        assert_eq!(cb.state(), CircuitState::Open);
    }
}
