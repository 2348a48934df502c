//! Progressive batch sizing subsystem.
//!
//! # Data Flow
//! ```text
//! After each batch write:
//!     BatchResult (+ optional ConnectionMetrics, remaining records)
//!     → classify.rs (error taxonomy)
//!     → reducer.rs strategy selection (strategy.rs ladders)
//!     → reduce / hold / grow
//!     → BatchDecision (size, delay, retry, individual-record mode)
//! ```
//!
//! # Design Decisions
//! - One reducer per upload session, reset between sessions
//! - Strategy selection is re-evaluated on every decision unless pinned
//! - Decisions are advisory; the caller performs writes and waits

pub mod classify;
pub mod reducer;
pub mod strategy;

pub use classify::{classify, BatchError, ErrorKind};
pub use reducer::{
    BatchDecision, BatchReductionState, BatchResult, Confidence, ConnectionMetrics,
    Effectiveness, ProgressiveBatchReducer, ReductionRecord, ReductionSummary,
};
pub use strategy::{ReductionStage, ReductionStrategy, TriggerCondition};
