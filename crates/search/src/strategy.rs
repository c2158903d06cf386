//! The search strategy interface and what a search reports back.

use crate::action::ActionSet;
use crate::error::SearchError;
use crate::oracle::{Cost, Evaluator};
use looptune_ir::{Kernel, TransformDescriptor};
use serde::{Deserialize, Serialize};

/// Drives exploration of the transformation space from a root kernel.
pub trait SearchStrategy {
    fn name(&self) -> &'static str;

    fn search(
        &self,
        root: Kernel,
        actions: &ActionSet,
        evaluator: &dyn Evaluator,
    ) -> Result<SearchOutcome, SearchError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    MaxDepth,
    /// No child at the last level was legal and evaluated successfully.
    EmptyFrontier,
    BudgetExhausted,
}

/// Bookkeeping for one expansion level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LevelSummary {
    pub depth: usize,
    pub candidates: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub legality_defects: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub frontier: usize,
    /// Best cost seen so far, after this level.
    pub best_cost_ms: f64,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchStats {
    pub nodes: usize,
    /// Successful evaluations, including the baseline.
    pub evaluated: usize,
    pub failed: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub legality_defects: usize,
    pub levels: usize,
    pub elapsed_ms: f64,
}

impl SearchStats {
    pub fn absorb(&mut self, level: &LevelSummary) {
        self.evaluated += level.evaluated;
        self.failed += level.failed;
        self.rejected += level.rejected;
        self.duplicates += level.duplicates;
        self.legality_defects += level.legality_defects;
        self.levels += 1;
    }
}

/// One step along the winning path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryStep {
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<TransformDescriptor>,
    pub cost: Option<Cost>,
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best_history: Vec<TransformDescriptor>,
    pub best_cost: Cost,
    pub baseline_cost: Cost,
    pub best_state: Kernel,
    pub trajectory: Vec<TrajectoryStep>,
    pub levels: Vec<LevelSummary>,
    pub stats: SearchStats,
    pub termination: Termination,
}

impl SearchOutcome {
    pub fn speedup(&self) -> f64 {
        if self.best_cost.millis() > 0.0 {
            self.baseline_cost.millis() / self.best_cost.millis()
        } else {
            1.0
        }
    }

    pub fn improved(&self) -> bool {
        self.best_cost < self.baseline_cost
    }
}
