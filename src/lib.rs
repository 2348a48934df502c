//! Resilient batch uploads.
//!
//! Two cooperating controllers decide how a bulk upload proceeds against a
//! store that may be overloaded or failing:
//!
//! - [`resilience::CircuitBreaker`] decides whether the next request may go out
//! - [`batching::ProgressiveBatchReducer`] decides how large the next batch is
//!   and how long to wait before sending it
//!
//! Both are pure in-memory state machines fed with observed outcomes. The
//! [`pipeline::UploadPipeline`] wires them around a [`pipeline::BatchSink`].

pub mod batching;
pub mod clock;
pub mod config;
pub mod observability;
pub mod pipeline;
pub mod resilience;

pub use batching::{BatchDecision, BatchResult, ProgressiveBatchReducer};
pub use config::UploadConfig;
pub use pipeline::{BatchSink, UploadPipeline, UploadReport};
pub use resilience::{CircuitBreaker, CircuitState, Decision};
