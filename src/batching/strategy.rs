//! Reduction strategies: named ladders of stages.
//!
//! A session starts on stage 0 of its strategy. Each reduction advances one
//! stage (never past the last) and applies that stage's percentage, floor and
//! delay multiplier.

use serde::Serialize;

pub const AGGRESSIVE: &str = "aggressive";
pub const CONSERVATIVE: &str = "conservative";
pub const CONSTRAINT_FOCUSED: &str = "constraint_focused";

/// Signal that makes a stage reduce the batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    Timeout,
    Constraint,
    Memory,
    ConsecutiveFailures,
}

/// One rung of a strategy ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionStage {
    pub stage_number: usize,
    /// Smallest batch size a reduction into this stage produces.
    pub batch_size: usize,
    pub trigger_condition: TriggerCondition,
    /// Share of the current size removed on reduction, 0-100.
    pub reduction_percentage: u8,
    pub delay_multiplier: f64,
    pub retry_limit: u32,
    pub description: String,
}

/// A named ladder of stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionStrategy {
    pub name: String,
    pub description: String,
    pub stages: Vec<ReductionStage>,
    pub max_reduction_attempts: u32,
    pub allow_individual_fallback: bool,
}

impl ReductionStrategy {
    /// Stage at `index`, clamped to the last stage.
    pub fn stage(&self, index: usize) -> &ReductionStage {
        &self.stages[index.min(self.last_stage())]
    }

    pub fn last_stage(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }
}

fn stage(
    stage_number: usize,
    batch_size: usize,
    trigger_condition: TriggerCondition,
    reduction_percentage: u8,
    delay_multiplier: f64,
    retry_limit: u32,
    description: &str,
) -> ReductionStage {
    ReductionStage {
        stage_number,
        batch_size,
        trigger_condition,
        reduction_percentage,
        delay_multiplier,
        retry_limit,
        description: description.to_string(),
    }
}

/// Halve quickly on timeouts and fall back to single records.
pub fn aggressive() -> ReductionStrategy {
    use TriggerCondition::*;
    ReductionStrategy {
        name: AGGRESSIVE.to_string(),
        description: "Fast reduction for timeout-heavy uploads".to_string(),
        stages: vec![
            stage(0, 25, Timeout, 50, 1.0, 2, "Initial batch size"),
            stage(1, 10, Timeout, 50, 1.5, 2, "Halve on timeout"),
            stage(2, 5, Timeout, 60, 2.0, 2, "Small batches"),
            stage(3, 2, ConsecutiveFailures, 60, 2.5, 3, "Minimal batches"),
            stage(4, 1, ConsecutiveFailures, 75, 3.0, 3, "Near-individual"),
            stage(5, 1, ConsecutiveFailures, 100, 4.0, 3, "Individual records"),
        ],
        max_reduction_attempts: 6,
        allow_individual_fallback: true,
    }
}

/// Gentle steps that keep batches reasonably large.
pub fn conservative() -> ReductionStrategy {
    use TriggerCondition::*;
    ReductionStrategy {
        name: CONSERVATIVE.to_string(),
        description: "Gradual reduction that preserves throughput".to_string(),
        stages: vec![
            stage(0, 50, ConsecutiveFailures, 20, 1.0, 3, "Initial batch size"),
            stage(1, 35, Timeout, 25, 1.25, 3, "Slight reduction"),
            stage(2, 20, Timeout, 30, 1.5, 3, "Moderate reduction"),
            stage(3, 10, Memory, 35, 2.0, 4, "Memory relief"),
            stage(4, 5, ConsecutiveFailures, 40, 2.5, 4, "Smallest conservative batch"),
        ],
        max_reduction_attempts: 8,
        allow_individual_fallback: false,
    }
}

/// Shrink fast on constraint violations so conflicting rows isolate quickly.
pub fn constraint_focused() -> ReductionStrategy {
    use TriggerCondition::*;
    ReductionStrategy {
        name: CONSTRAINT_FOCUSED.to_string(),
        description: "Isolate rows that violate uniqueness or foreign keys".to_string(),
        stages: vec![
            stage(0, 20, Constraint, 50, 1.0, 2, "Initial batch size"),
            stage(1, 10, Constraint, 50, 1.5, 2, "Split conflicting batch"),
            stage(2, 5, Constraint, 50, 2.0, 2, "Narrow down conflicts"),
            stage(3, 1, Constraint, 80, 2.5, 1, "Individual records"),
        ],
        max_reduction_attempts: 5,
        allow_individual_fallback: true,
    }
}

/// Names of the strategies every reducer starts with.
pub fn builtin_strategy_names() -> [&'static str; 3] {
    [AGGRESSIVE, CONSERVATIVE, CONSTRAINT_FOCUSED]
}

/// The built-in strategies keyed by name.
pub fn builtin_strategies() -> Vec<ReductionStrategy> {
    vec![aggressive(), conservative(), constraint_focused()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_match_tables() {
        let names: Vec<String> = builtin_strategies().into_iter().map(|s| s.name).collect();
        assert_eq!(names, builtin_strategy_names().map(String::from).to_vec());
    }

    #[test]
    fn test_stage_numbers_are_sequential() {
        for strategy in builtin_strategies() {
            for (i, stage) in strategy.stages.iter().enumerate() {
                assert_eq!(stage.stage_number, i, "{}", strategy.name);
                assert!(stage.reduction_percentage <= 100);
                assert!(stage.batch_size >= 1);
            }
        }
    }

    #[test]
    fn test_floors_never_increase_along_ladder() {
        for strategy in builtin_strategies() {
            for pair in strategy.stages.windows(2) {
                assert!(pair[1].batch_size <= pair[0].batch_size, "{}", strategy.name);
            }
        }
    }

    #[test]
    fn test_stage_lookup_clamps() {
        let s = constraint_focused();
        assert_eq!(s.last_stage(), 3);
        assert_eq!(s.stage(99).stage_number, 3);
    }

    #[test]
    fn test_fallback_strategies_end_at_one() {
        for strategy in builtin_strategies() {
            if strategy.allow_individual_fallback {
                assert_eq!(strategy.stage(strategy.last_stage()).batch_size, 1);
            }
        }
    }
}
