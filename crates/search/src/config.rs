//! Search configuration.

use serde::{Deserialize, Serialize};

/// How the children of one level are evaluated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    #[default]
    Serial,
    /// Evaluate on the worker pool, provided the evaluator is reentrant.
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BeamConfig {
    pub beam_width: usize,
    pub max_depth: usize,
    /// Wall-clock budget for the whole search; unlimited when unset.
    pub time_budget_ms: Option<u64>,
    pub evaluation: EvaluationMode,
    /// Worker pool size; rayon's default when unset.
    pub worker_threads: Option<usize>,
    /// Drop children whose state already exists in the tree. Off by default:
    /// with it on, a width-1 beam can skip the greedy choice.
    pub deduplicate: bool,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            max_depth: 4,
            time_budget_ms: None,
            evaluation: EvaluationMode::Serial,
            worker_threads: None,
            deduplicate: false,
        }
    }
}

impl BeamConfig {
    pub fn new(beam_width: usize, max_depth: usize) -> Self {
        Self {
            beam_width,
            max_depth,
            ..Self::default()
        }
    }

    /// Defaults overridden by `LOOPTUNE_*` environment variables.
    ///
    /// * `LOOPTUNE_BEAM_WIDTH=N`
    /// * `LOOPTUNE_MAX_DEPTH=N`
    /// * `LOOPTUNE_TIME_BUDGET_MS=N`
    /// * `LOOPTUNE_PARALLEL_EVAL=1`
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(width) = env_usize("LOOPTUNE_BEAM_WIDTH") {
            self.beam_width = width;
        }
        if let Some(depth) = env_usize("LOOPTUNE_MAX_DEPTH") {
            self.max_depth = depth;
        }
        if let Some(budget) = env_usize("LOOPTUNE_TIME_BUDGET_MS") {
            self.time_budget_ms = Some(budget as u64);
        }
        if let Ok(flag) = std::env::var("LOOPTUNE_PARALLEL_EVAL") {
            self.evaluation = if matches!(flag.as_str(), "1" | "true" | "yes") {
                EvaluationMode::Parallel
            } else {
                EvaluationMode::Serial
            };
        }
        self
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_time_budget_ms(mut self, budget: u64) -> Self {
        self.time_budget_ms = Some(budget);
        self
    }

    pub fn with_evaluation(mut self, evaluation: EvaluationMode) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.beam_width == 0 {
            return Err("beam width must be >= 1".into());
        }
        if self.worker_threads == Some(0) {
            return Err("worker threads must be >= 1 when set".into());
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}
