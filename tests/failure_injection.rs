//! Failure injection tests for the upload pipeline.
//!
//! Runs on a paused tokio clock: advisory sleeps and breaker cooldowns elapse
//! instantly but in order.

use std::sync::{Arc, Mutex};

use upload_resilience::batching::BatchError;
use upload_resilience::config::UploadConfig;
use upload_resilience::pipeline::{MemorySink, UploadError, UploadPipeline};
use upload_resilience::resilience::CircuitState;

mod common;

use common::{config_with, records, ScriptedSink};

#[tokio::test(start_paused = true)]
async fn test_clean_upload_uses_configured_batches() {
    let config = config_with(100, None);
    let mut pipeline = UploadPipeline::new(MemorySink::new(), &config).unwrap();

    let report = pipeline.upload(&records(250)).await.unwrap();

    assert_eq!(report.records_uploaded, 250);
    assert_eq!(report.records_failed, 0);
    assert_eq!(report.batches_attempted, 3);
    assert_eq!(report.circuit_state, CircuitState::Closed);
    assert_eq!(pipeline.sink().stored, records(250));
}

#[tokio::test(start_paused = true)]
async fn test_empty_upload() {
    let config = config_with(100, None);
    let mut pipeline = UploadPipeline::new(MemorySink::<u64>::new(), &config).unwrap();

    let report = pipeline.upload::<u64>(&[]).await.unwrap();

    assert_eq!(report.records_uploaded, 0);
    assert_eq!(report.batches_attempted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_shrink_batches_until_they_fit() {
    let config = config_with(50, Some("aggressive"));
    let sink = ScriptedSink::new(|batch: &[u64], _| {
        if batch.len() > 10 {
            Err(BatchError::message("Request timeout"))
        } else {
            Ok(())
        }
    });
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let report = pipeline.upload(&records(200)).await.unwrap();

    assert_eq!(report.records_uploaded, 200);
    assert_eq!(report.records_failed, 0);
    assert!(report.reduction.total_reductions >= 2);

    let sink = pipeline.into_sink();
    assert_eq!(&sink.write_sizes[..3], &[50, 25, 10]);
    assert_eq!(sink.stored, records(200));
}

#[tokio::test(start_paused = true)]
async fn test_constraint_violation_isolates_bad_record() {
    let mut config = config_with(100, None);
    config.pipeline.max_batch_attempts = 3;
    let sink = ScriptedSink::new(|batch: &[u64], _| {
        if batch.contains(&137) {
            Err(BatchError {
                message: Some("duplicate key value violates unique constraint".into()),
                code: Some("23505".into()),
            })
        } else {
            Ok(())
        }
    });
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let report = pipeline.upload(&records(300)).await.unwrap();

    assert_eq!(report.records_uploaded, 299);
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.reduction.strategy, "constraint_focused");

    let stored = &pipeline.sink().stored;
    assert_eq!(stored.len(), 299);
    assert!(!stored.contains(&137));
}

#[tokio::test(start_paused = true)]
async fn test_sustained_outage_gives_up_after_refusals() {
    let mut config = config_with(100, None);
    config.pipeline.max_refusals = 5;
    config.pipeline.max_wait_ms = 1_000;
    let sink = ScriptedSink::new(|_: &[u64], _| Err(BatchError::message("Network request failed")));
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let err = pipeline.upload(&records(500)).await.unwrap_err();

    match err {
        UploadError::CircuitOpen {
            refusals, uploaded, ..
        } => {
            assert_eq!(refusals, 5);
            assert_eq!(uploaded, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pipeline.breaker().state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_total_outage_with_defaults_is_an_error() {
    let config = UploadConfig::default();
    let sink = ScriptedSink::new(|_: &[u64], _| Err(BatchError::message("Network request failed")));
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let result = pipeline.upload(&records(5)).await;

    match result {
        Err(UploadError::CircuitOpen {
            refusals, uploaded, ..
        }) => {
            assert_eq!(refusals, config.pipeline.max_refusals);
            assert_eq!(uploaded, 0);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(report) => panic!(
            "outage reported as success: {} failed records",
            report.records_failed
        ),
    }
    assert!(pipeline.sink().stored.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recovers_through_half_open_probe() {
    let config = config_with(100, None);
    let sink = ScriptedSink::new(|_: &[u64], index| {
        if index < 4 {
            Err(BatchError::message("connection reset by peer"))
        } else {
            Ok(())
        }
    });
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    pipeline.breaker_mut().on_state_change(move |change| {
        seen.lock().unwrap().push((change.from, change.to));
    });

    let report = pipeline.upload(&records(400)).await.unwrap();

    assert_eq!(report.records_uploaded, 400);
    assert_eq!(report.circuit_state, CircuitState::Closed);
    assert!(report.refusals > 0);

    let transitions = transitions.lock().unwrap();
    assert_eq!(
        transitions.first(),
        Some(&(CircuitState::Closed, CircuitState::Open))
    );
    assert!(transitions.contains(&(CircuitState::Open, CircuitState::HalfOpen)));
    assert_eq!(
        transitions.last(),
        Some(&(CircuitState::HalfOpen, CircuitState::Closed))
    );
}

#[tokio::test(start_paused = true)]
async fn test_conservative_batch_exhausts_attempts() {
    let mut config = config_with(100, Some("conservative"));
    config.pipeline.max_batch_attempts = 1;
    let sink = ScriptedSink::new(|_: &[u64], _| Err(BatchError::message("permission denied")));
    let mut pipeline = UploadPipeline::new(sink, &config).unwrap();

    let err = pipeline.upload(&records(500)).await.unwrap_err();

    match err {
        UploadError::Exhausted {
            offset,
            attempts,
            source,
            ..
        } => {
            assert_eq!(offset, 0);
            assert_eq!(attempts, 1);
            assert_eq!(source.message.as_deref(), Some("permission denied"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
