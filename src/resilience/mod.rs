//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Before each batch write:
//!     → health.rs (score the caller's health snapshot)
//!     → circuit_breaker.rs (allow / refuse, suggested delay, alternative)
//! After each batch write:
//!     → circuit_breaker.rs record_result (weighted failure accounting,
//!       state transitions, listener notification)
//!
//! Optional composition:
//!     guard.rs wraps check → call → report for a single operation
//! ```
//!
//! # Design Decisions
//! - Pure in-memory controller; the caller performs all I/O and all waiting
//! - Timestamps come from an injected clock
//! - One breaker per upload session, never a process-wide singleton

pub mod circuit_breaker;
pub mod guard;
pub mod health;

pub use circuit_breaker::{
    AlternativeAction, CircuitBreaker, CircuitMetrics, CircuitState, Decision, FailureKind,
    HealthSummary, ListenerId, StateChange,
};
pub use guard::{with_circuit_breaker, GuardError};
pub use health::{health_score, ConnectionHealth, SystemHealth};
