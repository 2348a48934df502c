//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upload_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `upload_circuit_transitions_total` (counter): by circuit, from, to
//! - `upload_requests_total` (counter): recorded outcomes by circuit, outcome
//! - `upload_batch_size` (gauge): current batch size of the reducer
//! - `upload_batch_reductions_total` (counter): by error kind
//! - `upload_records_total` (counter): records by status
//!
//! Recording is a no-op until a recorder is installed, so controllers can be
//! used in tests and libraries without an exporter.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter on the given address.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!("upload_circuit_state", "circuit" => circuit.to_string()).set(state as f64);
}

pub fn record_circuit_transition(circuit: &str, from: &str, to: &str) {
    counter!(
        "upload_circuit_transitions_total",
        "circuit" => circuit.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_request_outcome(circuit: &str, outcome: &str) {
    counter!(
        "upload_requests_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn set_batch_size(size: usize) {
    gauge!("upload_batch_size").set(size as f64);
}

pub fn record_batch_reduction(kind: &str) {
    counter!("upload_batch_reductions_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_records(status: &str, count: usize) {
    counter!("upload_records_total", "status" => status.to_string()).increment(count as u64);
}
