//! System health signals and the 0-100 health score.
//!
//! # Score
//! ```text
//! start at 100
//!   connection critical      -40   (degraded -20)
//!   response time > 10s      -30   (> 5s -15, > 2s -5)
//!   error rate               -min(rate%, 30)
//!   memory pressure          -15
//!   consecutive failures     -min(5 * n, 25)
//!   timeout ratio            -min(20 * ratio, 20)
//! clamp to [0, 100]
//! ```
//! Callers that supply no snapshot get [`DEFAULT_HEALTH_SCORE`].

use serde::{Deserialize, Serialize};

/// Score used when no health snapshot is supplied.
pub const DEFAULT_HEALTH_SCORE: f64 = 75.0;

/// Coarse connection health reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of external health indicators at decision time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemHealth {
    pub connection_health: ConnectionHealth,
    /// Recent response time in milliseconds.
    pub response_time_ms: u64,
    /// Recent error rate, 0-100.
    pub error_rate_percent: f64,
    pub memory_pressure: bool,
    pub consecutive_failures: u32,
    /// Fraction of recent failures that were timeouts, 0.0-1.0.
    pub timeout_rate: f64,
    /// Fraction of recent failures that were constraint violations, 0.0-1.0.
    pub constraint_violation_rate: f64,
}

impl SystemHealth {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn with_connection(connection_health: ConnectionHealth) -> Self {
        Self {
            connection_health,
            ..Self::default()
        }
    }
}

/// Compute the 0-100 health score for an optional snapshot.
pub fn health_score(health: Option<&SystemHealth>) -> f64 {
    let Some(h) = health else {
        return DEFAULT_HEALTH_SCORE;
    };

    let mut score = 100.0;

    score -= match h.connection_health {
        ConnectionHealth::Critical => 40.0,
        ConnectionHealth::Degraded => 20.0,
        ConnectionHealth::Healthy => 0.0,
    };

    score -= match h.response_time_ms {
        t if t > 10_000 => 30.0,
        t if t > 5_000 => 15.0,
        t if t > 2_000 => 5.0,
        _ => 0.0,
    };

    score -= h.error_rate_percent.clamp(0.0, 30.0);

    if h.memory_pressure {
        score -= 15.0;
    }

    score -= (h.consecutive_failures as f64 * 5.0).min(25.0);
    score -= (h.timeout_rate.clamp(0.0, 1.0) * 20.0).min(20.0);

    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_snapshot_uses_default() {
        assert_eq!(health_score(None), DEFAULT_HEALTH_SCORE);
    }

    #[test]
    fn test_healthy_snapshot_scores_full() {
        assert_eq!(health_score(Some(&SystemHealth::healthy())), 100.0);
    }

    #[test]
    fn test_connection_deductions() {
        let degraded = SystemHealth::with_connection(ConnectionHealth::Degraded);
        let critical = SystemHealth::with_connection(ConnectionHealth::Critical);
        assert_eq!(health_score(Some(&degraded)), 80.0);
        assert_eq!(health_score(Some(&critical)), 60.0);
    }

    #[test]
    fn test_response_time_thresholds() {
        let at = |ms| {
            health_score(Some(&SystemHealth {
                response_time_ms: ms,
                ..Default::default()
            }))
        };
        assert_eq!(at(2_000), 100.0);
        assert_eq!(at(2_001), 95.0);
        assert_eq!(at(5_001), 85.0);
        assert_eq!(at(10_001), 70.0);
    }

    #[test]
    fn test_capped_deductions() {
        let h = SystemHealth {
            error_rate_percent: 80.0,
            consecutive_failures: 12,
            timeout_rate: 3.0,
            ..Default::default()
        };
        // 100 - 30 - 25 - 20
        assert_eq!(health_score(Some(&h)), 25.0);
    }

    #[test]
    fn test_score_never_negative() {
        let h = SystemHealth {
            connection_health: ConnectionHealth::Critical,
            response_time_ms: 60_000,
            error_rate_percent: 100.0,
            memory_pressure: true,
            consecutive_failures: 50,
            timeout_rate: 1.0,
            constraint_violation_rate: 1.0,
        };
        assert_eq!(health_score(Some(&h)), 0.0);
    }
}
