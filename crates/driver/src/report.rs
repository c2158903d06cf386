//! Tuning reports.
//!
//! A report records what a search found for one function in a form that can be
//! diffed against an earlier run and replayed later.

use anyhow::{Context, Result};
use looptune_ir::{Kernel, TransformDescriptor};
use looptune_search::{
    BeamConfig, LevelSummary, OracleConfig, SearchOutcome, SearchStats, Termination,
    TrajectoryStep,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningReport {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub backend: String,
    pub baseline_schedule: String,
    pub best_schedule: String,
    pub baseline_ms: f64,
    pub best_ms: f64,
    pub speedup: f64,
    /// Throughput of the tuned kernel; zero for pure data movement.
    #[serde(default)]
    pub best_gflops: f64,
    pub history: Vec<TransformDescriptor>,
    pub trajectory: Vec<TrajectoryStep>,
    pub levels: Vec<LevelSummary>,
    pub stats: SearchStats,
    pub termination: Termination,
    pub beam: BeamConfig,
    pub oracle: OracleConfig,
    pub generated_at_unix_ms: u128,
}

impl TuningReport {
    pub fn new(
        root: &Kernel,
        backend: &str,
        outcome: &SearchOutcome,
        beam: &BeamConfig,
        oracle: &OracleConfig,
    ) -> Self {
        Self {
            function: root.name.clone(),
            tag: root.tag.clone(),
            backend: backend.to_string(),
            baseline_schedule: root.schedule_summary(),
            best_schedule: outcome.best_state.schedule_summary(),
            baseline_ms: outcome.baseline_cost.millis(),
            best_ms: outcome.best_cost.millis(),
            speedup: outcome.speedup(),
            best_gflops: gflops(root, outcome.best_cost.millis()),
            history: outcome.best_history.clone(),
            trajectory: outcome.trajectory.clone(),
            levels: outcome.levels.clone(),
            stats: outcome.stats.clone(),
            termination: outcome.termination,
            beam: beam.clone(),
            oracle: oracle.clone(),
            generated_at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("reading tuning report {}", path.display()))?;
        serde_json::from_str(&blob)
            .with_context(|| format!("parsing tuning report {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Compare against an earlier report. `None` when the reports describe
    /// different functions.
    pub fn diff<'a>(&'a self, previous: &'a TuningReport) -> Option<ReportDelta<'a>> {
        if self.function != previous.function {
            return None;
        }
        Some(ReportDelta {
            current: self,
            previous,
            baseline_ms_delta: self.baseline_ms - previous.baseline_ms,
            best_ms_delta: self.best_ms - previous.best_ms,
            speedup_delta: self.speedup - previous.speedup,
            history_changed: self.history != previous.history,
        })
    }

    pub fn summary(&self) -> String {
        let history = if self.history.is_empty() {
            "(identity)".to_string()
        } else {
            self.history
                .iter()
                .map(|edit| edit.to_string())
                .collect::<Vec<_>>()
                .join(" ; ")
        };
        format!(
            "@{} on {}: {:.4} ms -> {:.4} ms ({:.2}x, {:.3} GFLOP/s, {:?})\n  schedule: {}\n  history:  {}",
            self.function,
            self.backend,
            self.baseline_ms,
            self.best_ms,
            self.speedup,
            self.best_gflops,
            self.termination,
            self.best_schedule,
            history
        )
    }
}

fn gflops(kernel: &Kernel, millis: f64) -> f64 {
    if millis > 0.0 {
        kernel.flops() / (millis * 1.0e6)
    } else {
        0.0
    }
}

#[derive(Debug)]
pub struct ReportDelta<'a> {
    pub current: &'a TuningReport,
    pub previous: &'a TuningReport,
    pub baseline_ms_delta: f64,
    pub best_ms_delta: f64,
    pub speedup_delta: f64,
    pub history_changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use looptune_ir::matmul;
    use looptune_search::{ActionSet, BeamSearch, Cost, EvaluationFailure, SearchStrategy};

    fn outcome_for(root: &Kernel) -> SearchOutcome {
        let evaluator = |kernel: &Kernel| -> Result<Cost, EvaluationFailure> {
            Ok(Cost::from_millis(10.0 - kernel.nest.len() as f64))
        };
        BeamSearch::new(BeamConfig::new(2, 1))
            .search(root.clone(), &ActionSet::default(), &evaluator)
            .unwrap()
    }

    #[test]
    fn report_carries_outcome_numbers() {
        let root = matmul("mm", 16, 16, 16);
        let outcome = outcome_for(&root);
        let report = TuningReport::new(
            &root,
            "cpu",
            &outcome,
            &BeamConfig::new(2, 1),
            &OracleConfig::default(),
        );

        assert_eq!(report.function, "mm");
        assert_eq!(report.tag.as_deref(), Some("matmul"));
        assert_abs_diff_eq!(report.baseline_ms, 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.best_ms, 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.speedup, 7.0 / 6.0, epsilon = 1e-12);
        // 2 * 16^3 flops in 6 ms
        assert_abs_diff_eq!(report.best_gflops, 8192.0 / 6.0e6, epsilon = 1e-12);
        assert_eq!(report.history.len(), 1);
        assert!(report.summary().contains("@mm on cpu"));
    }

    #[test]
    fn diff_against_saved_report() {
        let root = matmul("mm", 16, 16, 16);
        let outcome = outcome_for(&root);
        let report = TuningReport::new(
            &root,
            "cpu",
            &outcome,
            &BeamConfig::new(2, 1),
            &OracleConfig::default(),
        );

        let path = std::env::temp_dir()
            .join(format!("looptune-report-{}", std::process::id()))
            .join("report.json");
        report.save_to_file(&path).unwrap();
        let mut previous = TuningReport::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        previous.best_ms += 2.0;
        previous.history.clear();
        let delta = report.diff(&previous).unwrap();
        assert_abs_diff_eq!(delta.best_ms_delta, -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(delta.baseline_ms_delta, 0.0, epsilon = 1e-12);
        assert!(delta.history_changed);

        previous.function = "other".into();
        assert!(report.diff(&previous).is_none());
    }
}
