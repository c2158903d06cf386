//! Tuning session orchestration.

use crate::pipeline::{finalize, DriverConfig, KernelSelector, TuningArtifacts};
use crate::report::TuningReport;
use anyhow::{anyhow, Result};
use looptune_backend_cpu::{CpuExecutor, CpuExecutorOptions};
use looptune_ir::{Kernel, KernelModule};
use looptune_search::{
    ActionSet, BeamConfig, BeamSearch, CachingEvaluator, CostCache, Evaluator, ExecutionBackend,
    ExecutionOracle, OracleConfig, SearchError, SearchOutcome, SearchStrategy,
};
use std::fs;
use std::path::Path;
use tracing::info;

/// Search `root` on the CPU backend with default actions and oracle settings.
///
/// Returns the winning history with its measured cost, or the terminal
/// failure when the unmodified kernel cannot be measured.
pub fn run(
    root: &Kernel,
    beam_width: usize,
    max_depth: usize,
    repetitions: usize,
) -> Result<SearchOutcome, SearchError> {
    let oracle_config = OracleConfig {
        repetitions,
        ..OracleConfig::default()
    };
    oracle_config.validate().map_err(SearchError::InvalidConfig)?;
    let oracle = ExecutionOracle::calibrate(CpuExecutor::new(), root, oracle_config)
        .map_err(SearchError::BaselineFailed)?;
    BeamSearch::new(BeamConfig::new(beam_width, max_depth)).search(
        root.clone(),
        &ActionSet::default(),
        &oracle,
    )
}

#[derive(Debug)]
pub struct TuningResult {
    pub root: Kernel,
    pub outcome: SearchOutcome,
    pub artifacts: TuningArtifacts,
    pub report: TuningReport,
}

pub struct TuningSession {
    config: DriverConfig,
    cache: Option<CostCache>,
}

impl TuningSession {
    pub fn new(config: DriverConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|msg| anyhow!(SearchError::InvalidConfig(msg)))?;
        Ok(Self {
            config,
            cache: None,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn tune(&mut self, module: &KernelModule, selector: &KernelSelector) -> Result<TuningResult> {
        let root = selector.locate(module)?.clone();
        self.tune_kernel(root)
    }

    pub fn tune_kernel(&mut self, root: Kernel) -> Result<TuningResult> {
        let backend = CpuExecutor::with_options(CpuExecutorOptions {
            threads: self.config.executor_threads,
            concurrent_runs: self.config.concurrent_runs,
        })?;
        let backend_name = backend.name().to_string();

        info!(
            function = %root.name,
            schedule = %root.schedule_summary(),
            backend = %backend_name,
            beam_width = self.config.beam.beam_width,
            max_depth = self.config.beam.max_depth,
            "tuning kernel"
        );

        let oracle = ExecutionOracle::calibrate(backend, &root, self.config.oracle.clone())
            .map_err(SearchError::BaselineFailed)?;
        let cache = self.take_cache(&oracle.scope())?;
        let evaluator = CachingEvaluator::new(oracle, cache);

        let searched = BeamSearch::new(self.config.beam.clone()).search(
            root.clone(),
            &self.config.actions,
            &evaluator,
        );
        self.cache = Some(evaluator.into_cache());
        let outcome = searched?;

        let artifacts = finalize(&root, &outcome.best_history, self.config.validate_mlir)?;
        let report = TuningReport::new(
            &root,
            &backend_name,
            &outcome,
            &self.config.beam,
            &self.config.oracle,
        );

        info!(
            function = %root.name,
            baseline_ms = report.baseline_ms,
            best_ms = report.best_ms,
            speedup = report.speedup,
            steps = report.history.len(),
            "tuning finished"
        );

        if let Some(dir) = &self.config.dump_dir {
            dump_reproducer(dir, &root, &artifacts, &report)?;
        }

        Ok(TuningResult {
            root,
            outcome,
            artifacts,
            report,
        })
    }

    /// Persist the cost cache, if one is configured.
    pub fn shutdown(&mut self) -> Result<()> {
        if let (Some(path), Some(cache)) = (&self.config.cost_cache, &self.cache) {
            cache.save_to_file(path)?;
            info!(path = %path.display(), entries = cache.len(), "saved cost cache");
        }
        Ok(())
    }

    fn take_cache(&mut self, scope: &str) -> Result<CostCache> {
        match self.cache.take() {
            Some(cache) if cache.scope() == scope => Ok(cache),
            _ => match &self.config.cost_cache {
                Some(path) => CostCache::load_from_file(path, scope),
                None => Ok(CostCache::new(scope)),
            },
        }
    }
}

/// Write baseline and tuned MLIR, the transform script and the report.
fn dump_reproducer(
    dir: &Path,
    root: &Kernel,
    artifacts: &TuningArtifacts,
    report: &TuningReport,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    let stem = &root.name;
    fs::write(
        dir.join(format!("{}.baseline.mlir", stem)),
        KernelModule::new(vec![root.clone()]).to_mlir_text(),
    )?;
    fs::write(dir.join(format!("{}.tuned.mlir", stem)), &artifacts.mlir)?;
    fs::write(
        dir.join(format!("{}.transform.mlir", stem)),
        &artifacts.transform_script,
    )?;
    report.save_to_file(&dir.join(format!("{}.report.json", stem)))?;
    info!(dir = %dir.display(), function = %stem, "wrote reproducer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::{matmul, replay};
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("looptune-{}-{}", name, std::process::id()))
    }

    fn quick_config() -> DriverConfig {
        DriverConfig {
            beam: BeamConfig::new(2, 1).with_deduplicate(true),
            oracle: OracleConfig {
                warmup_runs: 0,
                repetitions: 1,
                ..OracleConfig::default()
            },
            ..DriverConfig::default()
        }
    }

    #[test]
    fn run_returns_a_replayable_history() {
        let root = matmul("mm", 16, 16, 16);
        let outcome = run(&root, 2, 2, 1).unwrap();
        assert!(outcome.best_cost <= outcome.baseline_cost);
        let replayed = replay(&root, &outcome.best_history).unwrap();
        assert_eq!(replayed.nest, outcome.best_state.nest);
    }

    #[test]
    fn run_rejects_zero_repetitions() {
        let root = matmul("mm", 8, 8, 8);
        assert!(matches!(
            run(&root, 2, 1, 0),
            Err(SearchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn session_rejects_invalid_config() {
        let config = DriverConfig {
            beam: BeamConfig::new(0, 1),
            ..DriverConfig::default()
        };
        assert!(TuningSession::new(config).is_err());
    }

    #[test]
    fn tune_writes_reproducer_and_cache() {
        let dir = scratch("session");
        let config = DriverConfig {
            cost_cache: Some(dir.join("costs.json")),
            dump_dir: Some(dir.join("dump")),
            ..quick_config()
        };
        let module = KernelModule::new(vec![matmul("mm", 16, 16, 16)]);

        let mut session = TuningSession::new(config.clone()).unwrap();
        let result = session
            .tune(&module, &KernelSelector::Tag("matmul".into()))
            .unwrap();
        session.shutdown().unwrap();

        assert_eq!(result.report.function, "mm");
        assert!(result.report.best_ms <= result.report.baseline_ms);
        assert_eq!(result.artifacts.kernel.nest, result.outcome.best_state.nest);
        for file in [
            "mm.baseline.mlir",
            "mm.tuned.mlir",
            "mm.transform.mlir",
            "mm.report.json",
        ] {
            assert!(dir.join("dump").join(file).exists(), "missing {}", file);
        }

        let mut reopened = TuningSession::new(config).unwrap();
        let scope = result_scope(&module);
        let cache = reopened.take_cache(&scope).unwrap();
        assert_eq!(cache.len(), result.outcome.stats.nodes);

        let _ = fs::remove_dir_all(&dir);
    }

    fn result_scope(module: &KernelModule) -> String {
        let oracle = ExecutionOracle::calibrate(
            CpuExecutor::new(),
            &module.kernels[0],
            quick_config().oracle,
        )
        .unwrap();
        oracle.scope()
    }
}
