//! CLI wiring for looptune.

use crate::pipeline::{finalize, DriverConfig, KernelSelector};
use crate::report::TuningReport;
use crate::samples::sample_module;
use crate::session::TuningSession;
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use looptune_backend_cpu::CpuExecutor;
use looptune_ir::KernelModule;
use looptune_search::{EvaluationMode, Evaluator, ExecutionOracle, Reduction};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "looptune", about = "Execution-driven loop nest autotuner")]
pub struct Cli {
    /// Driver config (JSON). Environment and flags override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kernel module (JSON). The built-in sample module when omitted.
    #[arg(long, global = true)]
    pub module: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Function to operate on.
    #[arg(long, conflicts_with = "tag")]
    pub function: Option<String>,
    /// Pick the first kernel carrying this tag instead.
    #[arg(long)]
    pub tag: Option<String>,
}

impl TargetArgs {
    pub fn selector(&self) -> Option<KernelSelector> {
        match (&self.function, &self.tag) {
            (Some(name), _) => Some(KernelSelector::Function(name.clone())),
            (None, Some(tag)) => Some(KernelSelector::Tag(tag.clone())),
            (None, None) => None,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct TuneArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long)]
    pub beam_width: Option<usize>,
    #[arg(long)]
    pub max_depth: Option<usize>,
    #[arg(long)]
    pub time_budget_ms: Option<u64>,
    #[arg(long)]
    pub repetitions: Option<usize>,
    #[arg(long)]
    pub warmup: Option<usize>,
    #[arg(long)]
    pub reduction: Option<Reduction>,
    /// Skip comparing candidate outputs with the baseline output.
    #[arg(long, default_value_t = false)]
    pub no_verify: bool,
    /// Evaluate the candidates of a level concurrently.
    #[arg(long, default_value_t = false)]
    pub parallel_eval: bool,
    /// Threads for parallel loops inside a candidate.
    #[arg(long)]
    pub threads: Option<usize>,
    #[arg(long)]
    pub cost_cache: Option<PathBuf>,
    /// Directory for baseline/tuned MLIR, transform script and report.
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,
    /// Write the tuning report here.
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Earlier report to diff against.
    #[arg(long)]
    pub baseline: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub print_mlir: bool,
}

impl TuneArgs {
    pub fn apply(&self, config: &mut DriverConfig) {
        if let Some(width) = self.beam_width {
            config.beam.beam_width = width;
        }
        if let Some(depth) = self.max_depth {
            config.beam.max_depth = depth;
        }
        if let Some(budget) = self.time_budget_ms {
            config.beam.time_budget_ms = Some(budget);
        }
        if self.parallel_eval {
            config.beam.evaluation = EvaluationMode::Parallel;
            config.concurrent_runs = true;
        }
        if let Some(repetitions) = self.repetitions {
            config.oracle.repetitions = repetitions;
        }
        if let Some(warmup) = self.warmup {
            config.oracle.warmup_runs = warmup;
        }
        if let Some(reduction) = self.reduction {
            config.oracle.reduction = reduction;
        }
        if self.no_verify {
            config.oracle.verify = false;
        }
        if self.threads.is_some() {
            config.executor_threads = self.threads;
        }
        if self.cost_cache.is_some() {
            config.cost_cache = self.cost_cache.clone();
        }
        if self.dump_dir.is_some() {
            config.dump_dir = self.dump_dir.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search for a faster schedule of one kernel.
    Tune(TuneArgs),
    /// Emit the MLIR of the module, or of a single kernel.
    EmitMlir {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Re-apply the history recorded in a tuning report.
    Replay {
        #[arg(long)]
        report: PathBuf,
        /// Print the transform script as well as the tuned MLIR.
        #[arg(long, default_value_t = false)]
        script: bool,
        /// Measure the replayed kernel and compare with the recorded latency.
        #[arg(long, default_value_t = false)]
        measure: bool,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli {
        config,
        module,
        command,
    } = cli;
    let mut config = match &config {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::default(),
    }
    .with_env_overrides();
    let module = load_module(module.as_deref())?;

    match command {
        Command::Tune(args) => {
            args.apply(&mut config);
            let Some(selector) = args.target.selector() else {
                bail!("tune needs --function or --tag");
            };

            let mut session = TuningSession::new(config)?;
            let result = session.tune(&module, &selector)?;
            println!("{}", result.report.summary());

            if args.print_mlir {
                println!("{}", result.artifacts.mlir);
                println!("{}", result.artifacts.transform_script);
            }

            if let Some(path) = &args.baseline {
                if path.exists() {
                    let previous = TuningReport::load_from_file(path)?;
                    match result.report.diff(&previous) {
                        Some(delta) => println!(
                            "Δ @{}: baseline_ms={:+.4} best_ms={:+.4} speedup={:+.3} history_changed={}",
                            result.report.function,
                            delta.baseline_ms_delta,
                            delta.best_ms_delta,
                            delta.speedup_delta,
                            delta.history_changed
                        ),
                        None => info!(
                            path = %path.display(),
                            function = %previous.function,
                            "baseline report is for another function; skipping diff"
                        ),
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = &args.output {
                result.report.save_to_file(path)?;
            }
            session.shutdown()?;
        }
        Command::EmitMlir { target } => match target.selector() {
            Some(selector) => {
                let kernel = selector.locate(&module)?;
                println!("{}", KernelModule::new(vec![kernel.clone()]).to_mlir_text());
            }
            None => println!("{}", module.to_mlir_text()),
        },
        Command::Replay {
            report,
            script,
            measure,
        } => {
            let report = TuningReport::load_from_file(&report)?;
            let root = KernelSelector::Function(report.function.clone()).locate(&module)?;
            let artifacts = finalize(root, &report.history, config.validate_mlir)?;
            println!("{}", artifacts.mlir);
            if script {
                println!("{}", artifacts.transform_script);
            }

            if measure {
                let oracle = ExecutionOracle::calibrate(CpuExecutor::new(), root, config.oracle)?;
                let cost = oracle.evaluate(&artifacts.kernel)?;
                println!(
                    "@{}: recorded {:.4} ms, measured {}",
                    report.function, report.best_ms, cost
                );
            }
        }
    }
    Ok(())
}

fn load_module(path: Option<&Path>) -> Result<KernelModule> {
    match path {
        Some(path) => KernelModule::load(path),
        None => sample_module(),
    }
}
