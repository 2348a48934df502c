//! Upload orchestration.
//!
//! # Data Flow
//! ```text
//! records
//!     → upload.rs loop:
//!         breaker.check_request(observed health)
//!           refused  → sleep suggested delay (capped), count refusal
//!           allowed  → sink.write(next chunk)
//!         breaker.record_result(outcome, weighted failure kind)
//!         reducer.make_decision(outcome, observed health, remaining)
//!         sleep decision delay
//!     → UploadReport
//! ```

pub mod sink;
pub mod upload;

pub use sink::{BatchSink, MemorySink};
pub use upload::{UploadError, UploadPipeline, UploadReport};
