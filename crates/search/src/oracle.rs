//! Evaluation by execution.
//!
//! The [`ExecutionBackend`] is the narrow `compile_and_run` seam to whatever
//! actually lowers and runs a kernel. [`ExecutionOracle`] wraps a backend with
//! warmup, repeated timing, a deterministic reduction and output verification.

use looptune_ir::{Kernel, KernelInputs};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Measured latency in milliseconds. Lower is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(f64);

impl Cost {
    pub fn from_millis(ms: f64) -> Self {
        Self(ms)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_secs_f64() * 1000.0)
    }

    pub fn millis(&self) -> f64 {
        self.0
    }
}

impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ms", self.0)
    }
}

/// Why a candidate has no cost. Always per-candidate and recoverable.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum EvaluationFailure {
    #[error("compilation failed: {0}")]
    Compilation(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("output differs from reference: {0}")]
    ResultMismatch(String),
}

/// Anything that can put a cost on a kernel state.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, kernel: &Kernel) -> Result<Cost, EvaluationFailure>;

    /// Whether concurrent `evaluate` calls on independent kernels are safe.
    fn reentrant(&self) -> bool {
        true
    }

    /// Identifies the measurement setup, used to scope cached costs.
    fn scope(&self) -> String {
        "custom".to_string()
    }
}

impl<F> Evaluator for F
where
    F: Fn(&Kernel) -> Result<Cost, EvaluationFailure> + Send + Sync,
{
    fn evaluate(&self, kernel: &Kernel) -> Result<Cost, EvaluationFailure> {
        self(kernel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub warmup_runs: usize,
    pub repetitions: usize,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            repetitions: 5,
            timeout: None,
        }
    }
}

/// Timed samples from one `compile_and_run` call plus the computed output.
#[derive(Debug, Clone)]
pub struct Execution {
    pub samples: Vec<Duration>,
    pub output: ArrayD<f32>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ExecutionError> for EvaluationFailure {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Compile(msg) => EvaluationFailure::Compilation(msg),
            ExecutionError::Runtime(msg) => EvaluationFailure::Execution(msg),
            ExecutionError::Timeout(limit) => EvaluationFailure::Timeout(limit.as_millis() as u64),
        }
    }
}

/// Lowers, links and runs a kernel state.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn compile_and_run(
        &self,
        kernel: &Kernel,
        inputs: &KernelInputs,
        options: &RunOptions,
    ) -> Result<Execution, ExecutionError>;

    /// Whether independent kernels may be compiled and run concurrently.
    fn reentrant(&self) -> bool {
        true
    }
}

/// How timed samples collapse into one cost.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    #[default]
    Min,
    Median,
    Mean,
}

impl Reduction {
    pub fn reduce(&self, samples: &[Duration]) -> Option<Duration> {
        if samples.is_empty() {
            return None;
        }
        match self {
            Reduction::Min => samples.iter().min().copied(),
            Reduction::Median => {
                let mut sorted = samples.to_vec();
                sorted.sort_unstable();
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2)
                } else {
                    Some(sorted[mid])
                }
            }
            Reduction::Mean => {
                let total: Duration = samples.iter().sum();
                Some(total / samples.len() as u32)
            }
        }
    }
}

impl std::str::FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(Reduction::Min),
            "median" => Ok(Reduction::Median),
            "mean" => Ok(Reduction::Mean),
            other => Err(format!("unknown reduction `{}`", other)),
        }
    }
}

/// Tolerance for comparing a candidate's output with the reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VerificationTolerance {
    pub max_abs_error: f32,
    /// Applied to reference values with magnitude above 1e-6.
    pub max_rel_error: f32,
}

impl Default for VerificationTolerance {
    fn default() -> Self {
        Self {
            max_abs_error: 1e-3,
            max_rel_error: 1e-3,
        }
    }
}

impl VerificationTolerance {
    pub fn compare(&self, reference: &ArrayD<f32>, candidate: &ArrayD<f32>) -> Result<(), String> {
        if reference.shape() != candidate.shape() {
            return Err(format!(
                "shape mismatch: {:?} vs {:?}",
                reference.shape(),
                candidate.shape()
            ));
        }

        for (index, (r, c)) in reference.iter().zip(candidate.iter()).enumerate() {
            let abs_err = (r - c).abs();
            if abs_err.is_nan() {
                return Err(format!("output element {} is NaN", index));
            }
            // an element fails only when it exceeds both bounds; near-zero
            // references have no meaningful relative error
            if abs_err > self.max_abs_error
                && (r.abs() <= 1e-6 || abs_err / r.abs() > self.max_rel_error)
            {
                return Err(format!(
                    "element {}: expected {}, got {} (abs error {:.3e})",
                    index, r, c, abs_err
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub warmup_runs: usize,
    pub repetitions: usize,
    pub reduction: Reduction,
    /// Per-candidate wall-clock limit; unlimited when unset.
    pub timeout_ms: Option<u64>,
    pub verify: bool,
    pub tolerance: VerificationTolerance,
    pub seed: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            repetitions: 5,
            reduction: Reduction::Min,
            timeout_ms: Some(10_000),
            verify: true,
            tolerance: VerificationTolerance::default(),
            seed: 0x5eed,
        }
    }
}

impl OracleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.repetitions == 0 {
            return Err("repetitions must be >= 1".into());
        }
        if self.timeout_ms == Some(0) {
            return Err("timeout must be > 0 ms when set".into());
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            warmup_runs: self.warmup_runs,
            repetitions: self.repetitions,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Evaluator that measures candidates by running them on a backend.
pub struct ExecutionOracle<B> {
    backend: B,
    config: OracleConfig,
    inputs: KernelInputs,
    reference: Option<ArrayD<f32>>,
}

impl<B: ExecutionBackend> ExecutionOracle<B> {
    /// Build an oracle for `root`, capturing its output as the reference when
    /// verification is enabled.
    pub fn calibrate(
        backend: B,
        root: &Kernel,
        config: OracleConfig,
    ) -> Result<Self, EvaluationFailure> {
        let inputs = KernelInputs::random(root, config.seed);
        let mut oracle = Self {
            backend,
            config,
            inputs,
            reference: None,
        };
        if oracle.config.verify {
            let options = RunOptions {
                warmup_runs: 0,
                repetitions: 1,
                timeout: oracle.config.run_options().timeout,
            };
            let execution = oracle
                .backend
                .compile_and_run(root, &oracle.inputs, &options)?;
            oracle.reference = Some(execution.output);
        }
        Ok(oracle)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn inputs(&self) -> &KernelInputs {
        &self.inputs
    }

    pub fn reference(&self) -> Option<&ArrayD<f32>> {
        self.reference.as_ref()
    }
}

impl<B: ExecutionBackend> Evaluator for ExecutionOracle<B> {
    fn evaluate(&self, kernel: &Kernel) -> Result<Cost, EvaluationFailure> {
        if !self.inputs.fits(kernel) {
            return Err(EvaluationFailure::Compilation(format!(
                "inputs do not match tensors of `{}`",
                kernel.name
            )));
        }

        let execution = self
            .backend
            .compile_and_run(kernel, &self.inputs, &self.config.run_options())?;

        if let Some(reference) = &self.reference {
            self.config
                .tolerance
                .compare(reference, &execution.output)
                .map_err(EvaluationFailure::ResultMismatch)?;
        }

        let reduced = self
            .config
            .reduction
            .reduce(&execution.samples)
            .ok_or_else(|| EvaluationFailure::Execution("no timed samples".to_string()))?;

        debug!(
            kernel = %kernel.name,
            schedule = %kernel.schedule_summary(),
            samples = execution.samples.len(),
            time_ms = reduced.as_secs_f64() * 1000.0,
            "measured candidate"
        );
        Ok(Cost::from_duration(reduced))
    }

    fn reentrant(&self) -> bool {
        self.backend.reentrant()
    }

    fn scope(&self) -> String {
        let verify = if self.config.verify {
            format!(
                "abs{:e}:rel{:e}",
                self.config.tolerance.max_abs_error, self.config.tolerance.max_rel_error
            )
        } else {
            "noverify".to_string()
        };
        let timeout = match self.config.timeout_ms {
            Some(ms) => format!("t{}", ms),
            None => "tnone".to_string(),
        };
        format!(
            "{}:w{}:r{}:{:?}:seed{}:{}:{}",
            self.backend.name(),
            self.config.warmup_runs,
            self.config.repetitions,
            self.config.reduction,
            self.config.seed,
            verify,
            timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::{apply_edit, matvec, TransformDescriptor};
    use ndarray::IxDyn;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Backend returning scripted samples and a constant output.
    struct ScriptedBackend {
        samples_ms: Vec<u64>,
        fill: f32,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(samples_ms: Vec<u64>) -> Self {
            Self {
                samples_ms,
                fill: 1.0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ExecutionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn compile_and_run(
            &self,
            kernel: &Kernel,
            _inputs: &KernelInputs,
            options: &RunOptions,
        ) -> Result<Execution, ExecutionError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if kernel.nest.parallel_loop().is_some() {
                return Err(ExecutionError::Compile("no threads here".into()));
            }
            // every call after calibration returns a different value when tiled
            let fill = if call > 0 && kernel.nest.len() > 2 {
                self.fill + 1.0
            } else {
                self.fill
            };
            let samples = self
                .samples_ms
                .iter()
                .take(options.repetitions)
                .map(|&ms| Duration::from_millis(ms))
                .collect();
            Ok(Execution {
                samples,
                output: ArrayD::from_elem(IxDyn(&kernel.output_tensor().shape), fill),
            })
        }
    }

    #[test]
    fn reductions_are_deterministic() {
        let samples: Vec<Duration> = [5u64, 1, 9, 3]
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        assert_eq!(Reduction::Min.reduce(&samples), Some(Duration::from_millis(1)));
        assert_eq!(Reduction::Median.reduce(&samples), Some(Duration::from_millis(4)));
        assert_eq!(Reduction::Mean.reduce(&samples), Some(Duration::from_micros(4500)));
        assert_eq!(Reduction::Min.reduce(&[]), None);
        assert_eq!("median".parse::<Reduction>(), Ok(Reduction::Median));
    }

    #[test]
    fn oracle_reduces_samples_with_min() {
        let kernel = matvec("mv", 8, 8);
        let config = OracleConfig {
            repetitions: 3,
            ..OracleConfig::default()
        };
        let oracle = ExecutionOracle::calibrate(ScriptedBackend::new(vec![4, 2, 7]), &kernel, config)
            .expect("calibrate");
        let cost = oracle.evaluate(&kernel).expect("evaluate");
        assert_eq!(cost, Cost::from_millis(2.0));
        assert!(oracle.reference().is_some());
    }

    #[test]
    fn oracle_maps_backend_failures() {
        let kernel = matvec("mv", 8, 8);
        let oracle = ExecutionOracle::calibrate(
            ScriptedBackend::new(vec![1]),
            &kernel,
            OracleConfig::default(),
        )
        .expect("calibrate");

        let parallel = apply_edit(&kernel, &TransformDescriptor::Parallelize { loop_index: 0 })
            .expect("parallelize");
        assert!(matches!(
            oracle.evaluate(&parallel),
            Err(EvaluationFailure::Compilation(_))
        ));

        let tiled = apply_edit(&kernel, &TransformDescriptor::Tile { loop_index: 1, size: 4 })
            .expect("tile");
        assert!(matches!(
            oracle.evaluate(&tiled),
            Err(EvaluationFailure::ResultMismatch(_))
        ));
    }

    #[test]
    fn tolerance_accepts_rounding_noise() {
        let tolerance = VerificationTolerance::default();
        let reference = ArrayD::from_elem(IxDyn(&[4]), 1000.0f32);
        let noisy = ArrayD::from_elem(IxDyn(&[4]), 1000.01f32);
        assert!(tolerance.compare(&reference, &noisy).is_ok());

        let wrong = ArrayD::from_elem(IxDyn(&[4]), 1010.0f32);
        assert!(tolerance.compare(&reference, &wrong).is_err());
        let reshaped = ArrayD::from_elem(IxDyn(&[2, 2]), 1000.0f32);
        assert!(tolerance.compare(&reference, &reshaped).is_err());
    }

    #[test]
    fn tolerance_is_checked_per_element() {
        let tolerance = VerificationTolerance::default();
        // first element drifts absolutely, second relatively; each is within one bound
        let reference = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1000.0f32, 0.01]).unwrap();
        let drifted = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1000.5f32, 0.01002]).unwrap();
        assert!(tolerance.compare(&reference, &drifted).is_ok());
    }

    #[test]
    fn tolerance_catches_errors_at_zero_reference() {
        let tolerance = VerificationTolerance::default();
        let reference = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0f32, 1.0]).unwrap();
        let wrong = ArrayD::from_shape_vec(IxDyn(&[2]), vec![5.0f32, 1.0]).unwrap();
        let err = tolerance.compare(&reference, &wrong).unwrap_err();
        assert!(err.starts_with("element 0"), "{}", err);

        let tiny = ArrayD::from_shape_vec(IxDyn(&[2]), vec![5e-4f32, 1.0]).unwrap();
        assert!(tolerance.compare(&reference, &tiny).is_ok());
    }

    #[test]
    fn scope_tracks_verification_and_timeout() {
        let kernel = matvec("mv", 8, 8);
        let scope_of = |config: OracleConfig| {
            ExecutionOracle::calibrate(ScriptedBackend::new(vec![1]), &kernel, config)
                .expect("calibrate")
                .scope()
        };
        let strict = scope_of(OracleConfig {
            verify: true,
            timeout_ms: Some(1),
            ..OracleConfig::default()
        });
        let lax = scope_of(OracleConfig {
            verify: false,
            timeout_ms: None,
            ..OracleConfig::default()
        });
        let looser = scope_of(OracleConfig {
            timeout_ms: Some(1),
            tolerance: VerificationTolerance {
                max_abs_error: 1e-1,
                max_rel_error: 1e-3,
            },
            ..OracleConfig::default()
        });
        assert_ne!(strict, lax);
        assert_ne!(strict, looser);
        assert_eq!(
            strict,
            scope_of(OracleConfig {
                timeout_ms: Some(1),
                ..OracleConfig::default()
            })
        );
    }

    #[test]
    fn closures_are_evaluators() {
        let evaluator = |kernel: &Kernel| -> Result<Cost, EvaluationFailure> {
            Ok(Cost::from_millis(kernel.nest.len() as f64))
        };
        assert_eq!(
            evaluator.evaluate(&matvec("mv", 4, 4)),
            Ok(Cost::from_millis(2.0))
        );
        assert!(evaluator.reentrant());
    }
}
