//! Driver configuration and the post-search pipeline.

use crate::script::render_transform_script;
use anyhow::{anyhow, Context, Result};
use looptune_ir::{replay, Kernel, KernelModule, TransformDescriptor};
use looptune_search::{ActionSet, BeamConfig, EvaluationMode, OracleConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a tuning session needs, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub beam: BeamConfig,
    pub oracle: OracleConfig,
    pub actions: ActionSet,
    /// Threads used by parallel loops inside a candidate.
    pub executor_threads: Option<usize>,
    /// Let the CPU backend time several candidates at once.
    pub concurrent_runs: bool,
    pub cost_cache: Option<PathBuf>,
    pub dump_dir: Option<PathBuf>,
    pub validate_mlir: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            beam: BeamConfig::default(),
            oracle: OracleConfig::default(),
            actions: ActionSet::default(),
            executor_threads: None,
            concurrent_runs: false,
            cost_cache: None,
            dump_dir: None,
            validate_mlir: cfg!(feature = "mlir"),
        }
    }
}

impl DriverConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading driver config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing driver config {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `LOOPTUNE_*` overrides. Parallel evaluation also turns on
    /// concurrent backend runs, otherwise the search would fall back to
    /// serial evaluation.
    pub fn with_env_overrides(mut self) -> Self {
        self.beam = self.beam.with_env_overrides();
        if self.beam.evaluation == EvaluationMode::Parallel {
            self.concurrent_runs = true;
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        self.beam.validate()?;
        self.oracle.validate()?;
        if self.actions.is_empty() {
            return Err("at least one transformation action is required".into());
        }
        if self.executor_threads == Some(0) {
            return Err("executor_threads must be >= 1 when set".into());
        }
        Ok(())
    }
}

/// How the kernel to tune is picked out of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSelector {
    Function(String),
    Tag(String),
}

impl KernelSelector {
    pub fn locate<'m>(&self, module: &'m KernelModule) -> Result<&'m Kernel> {
        match self {
            KernelSelector::Function(name) => module
                .locate(name)
                .ok_or_else(|| anyhow!("no function named `{}` in module", name)),
            KernelSelector::Tag(tag) => module
                .locate_tagged(tag)
                .ok_or_else(|| anyhow!("no kernel tagged `{}` in module", tag)),
        }
    }
}

impl std::fmt::Display for KernelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelSelector::Function(name) => write!(f, "@{}", name),
            KernelSelector::Tag(tag) => write!(f, "tag:{}", tag),
        }
    }
}

/// Output of re-applying a winning history.
#[derive(Debug, Clone)]
pub struct TuningArtifacts {
    pub kernel: Kernel,
    pub mlir: String,
    pub transform_script: String,
}

/// Re-apply `history` to `root` and render the result.
pub fn finalize(
    root: &Kernel,
    history: &[TransformDescriptor],
    validate_mlir: bool,
) -> Result<TuningArtifacts> {
    let kernel = replay(root, history).map_err(|(step, err)| {
        anyhow!(
            "step {} ({}) no longer applies to `{}`: {}",
            step,
            history[step],
            root.name,
            err
        )
    })?;

    let mlir = KernelModule::new(vec![kernel.clone()]).to_mlir_text();
    if validate_mlir {
        check_mlir(&mlir)?;
    }

    Ok(TuningArtifacts {
        transform_script: render_transform_script(&root.name, history),
        kernel,
        mlir,
    })
}

#[cfg(feature = "mlir")]
fn check_mlir(text: &str) -> Result<()> {
    looptune_ir::validate_mlir_text(text)
}

#[cfg(not(feature = "mlir"))]
fn check_mlir(_text: &str) -> Result<()> {
    tracing::debug!("built without the `mlir` feature, skipping MLIR validation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::{matmul, transpose};

    #[test]
    fn finalize_replays_history() {
        let root = matmul("mm", 64, 64, 64);
        let history = vec![
            TransformDescriptor::Tile {
                loop_index: 0,
                size: 16,
            },
            TransformDescriptor::Parallelize { loop_index: 0 },
        ];
        let artifacts = finalize(&root, &history, false).unwrap();
        assert_eq!(artifacts.kernel.nest.len(), 4);
        assert!(artifacts.kernel.nest.loops[0].parallel);
        assert!(artifacts.mlir.contains("func.func @mm("));
        assert!(artifacts.mlir.contains("scf.parallel"));
        assert!(artifacts.transform_script.contains("@__transform_main"));
    }

    #[test]
    fn finalize_reports_the_failing_step() {
        let root = transpose("tr", 8, 8);
        let history = vec![TransformDescriptor::Tile {
            loop_index: 0,
            size: 3,
        }];
        let err = finalize(&root, &history, false).unwrap_err().to_string();
        assert!(err.contains("step 0"), "{}", err);
    }

    #[test]
    fn selector_finds_by_name_and_tag() {
        let module = KernelModule::new(vec![matmul("mm", 8, 8, 8), transpose("tr", 4, 4)]);
        let by_name = KernelSelector::Function("tr".into()).locate(&module).unwrap();
        assert_eq!(by_name.name, "tr");
        let by_tag = KernelSelector::Tag("matmul".into()).locate(&module).unwrap();
        assert_eq!(by_tag.name, "mm");
        assert!(KernelSelector::Function("missing".into())
            .locate(&module)
            .is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = std::env::temp_dir().join(format!("looptune-config-{}", std::process::id()));
        let path = dir.join("driver.json");
        let config = DriverConfig {
            beam: BeamConfig::new(3, 2),
            dump_dir: Some(dir.join("dump")),
            ..DriverConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(DriverConfig::load_from_file(&path).unwrap(), config);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn parallel_eval_from_env_enables_concurrent_runs() {
        std::env::set_var("LOOPTUNE_PARALLEL_EVAL", "1");
        let config = DriverConfig::default().with_env_overrides();
        std::env::remove_var("LOOPTUNE_PARALLEL_EVAL");

        assert_eq!(config.beam.evaluation, EvaluationMode::Parallel);
        assert!(config.concurrent_runs);
    }

    #[test]
    fn partial_config_files_fill_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "beam": { "beam_width": 7 } }"#).unwrap();
        assert_eq!(config.beam.beam_width, 7);
        assert_eq!(config.beam.max_depth, BeamConfig::default().max_depth);
        assert_eq!(config.oracle, OracleConfig::default());
        assert!(config.validate().is_ok());
    }
}
