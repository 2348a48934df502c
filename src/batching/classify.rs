//! Batch error classification.
//!
//! Matching is by substring on the lowercased message and code, checked in
//! order: timeout, constraint, memory, network. Anything else is `Unknown`.

use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::FailureKind;

/// Error reported by the remote store for a failed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub message: Option<String>,
    pub code: Option<String>,
}

impl BatchError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            code: None,
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self {
            message: None,
            code: Some(code.into()),
        }
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "[{}] {}", code, message),
            (Some(code), None) => write!(f, "[{}]", code),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for BatchError {}

/// Error taxonomy for batch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Constraint,
    Memory,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Constraint => "constraint",
            Self::Memory => "memory",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => FailureKind::Timeout,
            ErrorKind::Network => FailureKind::Connection,
            ErrorKind::Memory => FailureKind::Memory,
            ErrorKind::Constraint | ErrorKind::Unknown => FailureKind::Other,
        }
    }
}

/// Classify an optional batch error.
pub fn classify(error: Option<&BatchError>) -> ErrorKind {
    let Some(error) = error else {
        return ErrorKind::Unknown;
    };
    let message = error.message.as_deref().unwrap_or_default().to_lowercase();
    let code = error.code.as_deref().unwrap_or_default().to_lowercase();
    let has = |needle: &str| message.contains(needle) || code.contains(needle);

    if has("timeout") || has("timed out") || has("pgrst301") {
        ErrorKind::Timeout
    } else if has("duplicate") || has("constraint") || has("23505") {
        ErrorKind::Constraint
    } else if has("memory") || has("heap") {
        ErrorKind::Memory
    } else if has("network") || has("connection") {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}
