//! CPU runtime: executes compiled loop nests natively.

use crate::planner::{Body, CompiledKernel, CpuPlanner, ParallelSplit, PlannedLoop, OPERANDS};
use anyhow::Result;
use looptune_ir::{Kernel, KernelInputs, MAX_VECTOR_WIDTH};
use looptune_search::{Execution, ExecutionBackend, ExecutionError, RunOptions};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CpuExecutorOptions {
    /// Threads for parallel loops; the global rayon pool when unset.
    pub threads: Option<usize>,
    /// Allow several kernels to be timed at once. Off by default since
    /// concurrent runs disturb each other's timings.
    pub concurrent_runs: bool,
}

pub struct CpuExecutor {
    planner: CpuPlanner,
    pool: Option<rayon::ThreadPool>,
    options: CpuExecutorOptions,
}

struct Operands<'a> {
    a: &'a [f32],
    b: &'a [f32],
}

impl CpuExecutor {
    pub fn new() -> Self {
        Self {
            planner: CpuPlanner,
            pool: None,
            options: CpuExecutorOptions::default(),
        }
    }

    pub fn with_options(options: CpuExecutorOptions) -> Result<Self> {
        let pool = match options.threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()?,
            ),
            None => None,
        };
        Ok(Self {
            planner: CpuPlanner,
            pool,
            options,
        })
    }

    pub fn planner(&self) -> &CpuPlanner {
        &self.planner
    }

    /// Compile and run `kernel` once, untimed.
    pub fn execute(
        &self,
        kernel: &Kernel,
        inputs: &KernelInputs,
    ) -> Result<ArrayD<f32>, ExecutionError> {
        let plan = self.planner.compile(kernel)?;
        let buffers = gather_inputs(&plan, inputs)?;
        let output = self.run_once(&plan, &operands(&buffers))?;
        into_array(&plan, output)
    }

    fn run_once(&self, plan: &CompiledKernel, ops: &Operands<'_>) -> Result<Vec<f32>, ExecutionError> {
        let run = || match &plan.parallel {
            Some(split) => run_parallel(plan, split, ops),
            None => {
                let mut out = vec![0.0f32; plan.output_len()];
                walk(&plan.loops, [0; OPERANDS], &mut out, ops, plan.body);
                Ok(out)
            }
        };
        let result = match &self.pool {
            Some(pool) => catch_unwind(AssertUnwindSafe(|| pool.install(run))),
            None => catch_unwind(AssertUnwindSafe(run)),
        };
        result.map_err(|_| ExecutionError::Runtime(format!("kernel `{}` trapped", plan.name)))?
    }
}

impl Default for CpuExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for CpuExecutor {
    fn name(&self) -> &str {
        "cpu"
    }

    fn compile_and_run(
        &self,
        kernel: &Kernel,
        inputs: &KernelInputs,
        options: &RunOptions,
    ) -> Result<Execution, ExecutionError> {
        let start = Instant::now();
        let plan = self.planner.compile(kernel)?;
        let buffers = gather_inputs(&plan, inputs)?;
        let ops = operands(&buffers);

        for _ in 0..options.warmup_runs {
            self.run_once(&plan, &ops)?;
            check_timeout(start, options.timeout)?;
        }

        let repetitions = options.repetitions.max(1);
        let mut samples = Vec::with_capacity(repetitions);
        let mut output = Vec::new();
        for _ in 0..repetitions {
            let run_start = Instant::now();
            output = self.run_once(&plan, &ops)?;
            samples.push(run_start.elapsed());
            check_timeout(start, options.timeout)?;
        }

        debug!(
            kernel = %plan.name,
            parallel = plan.parallel.is_some(),
            samples = samples.len(),
            "executed cpu plan"
        );
        Ok(Execution {
            samples,
            output: into_array(&plan, output)?,
        })
    }

    fn reentrant(&self) -> bool {
        self.options.concurrent_runs
    }
}

fn gather_inputs(plan: &CompiledKernel, inputs: &KernelInputs) -> Result<Vec<Vec<f32>>, ExecutionError> {
    plan.inputs
        .iter()
        .map(|&tensor| {
            inputs
                .tensor(tensor)
                .map(|array| array.iter().copied().collect())
                .ok_or_else(|| ExecutionError::Runtime(format!("missing input tensor {}", tensor)))
        })
        .collect()
}

fn operands(buffers: &[Vec<f32>]) -> Operands<'_> {
    Operands {
        a: buffers.first().map(Vec::as_slice).unwrap_or(&[]),
        b: buffers.get(1).map(Vec::as_slice).unwrap_or(&[]),
    }
}

fn into_array(plan: &CompiledKernel, output: Vec<f32>) -> Result<ArrayD<f32>, ExecutionError> {
    ArrayD::from_shape_vec(IxDyn(&plan.output_shape), output)
        .map_err(|err| ExecutionError::Runtime(err.to_string()))
}

fn check_timeout(start: Instant, timeout: Option<Duration>) -> Result<(), ExecutionError> {
    match timeout {
        Some(limit) if start.elapsed() > limit => Err(ExecutionError::Timeout(limit)),
        _ => Ok(()),
    }
}

fn run_parallel(
    plan: &CompiledKernel,
    split: &ParallelSplit,
    ops: &Operands<'_>,
) -> Result<Vec<f32>, ExecutionError> {
    let slab_len: usize = split.slab_shape.iter().product();
    let slabs: Vec<Vec<f32>> = (0..split.extent)
        .into_par_iter()
        .map(|t| {
            let mut slab = vec![0.0f32; slab_len];
            let offsets = [0, t * split.input_deltas[1], t * split.input_deltas[2]];
            walk(&split.slab_loops, offsets, &mut slab, ops, plan.body);
            slab
        })
        .collect();

    let mut out = vec![0.0f32; plan.output_len()];
    let mut view = ArrayViewMutD::from_shape(IxDyn(&plan.output_shape), out.as_mut_slice())
        .map_err(|err| ExecutionError::Runtime(err.to_string()))?;
    for (mut chunk, slab) in view
        .axis_chunks_iter_mut(Axis(split.axis), split.chunk)
        .zip(&slabs)
    {
        let slab = ArrayViewD::from_shape(IxDyn(&split.slab_shape), slab.as_slice())
            .map_err(|err| ExecutionError::Runtime(err.to_string()))?;
        chunk.assign(&slab);
    }
    Ok(out)
}

fn walk(loops: &[PlannedLoop], offsets: [usize; OPERANDS], out: &mut [f32], ops: &Operands<'_>, body: Body) {
    match loops.split_first() {
        None => out[offsets[0]] = compute(body, out, ops, offsets),
        Some((innermost, [])) => run_innermost(innermost, offsets, out, ops, body),
        Some((outer, rest)) => {
            let mut cursor = offsets;
            for _ in 0..outer.extent {
                walk(rest, cursor, out, ops, body);
                advance(&mut cursor, &outer.deltas);
            }
        }
    }
}

fn run_innermost(
    l: &PlannedLoop,
    offsets: [usize; OPERANDS],
    out: &mut [f32],
    ops: &Operands<'_>,
    body: Body,
) {
    let mut cursor = offsets;
    match l.vector_width {
        // reduction along the vector loop: accumulate in lanes, fold once
        Some(width) if body == Body::MulAcc && l.deltas[0] == 0 => {
            let mut lanes = [0.0f32; MAX_VECTOR_WIDTH];
            for _ in 0..l.extent / width {
                for lane in lanes[..width].iter_mut() {
                    *lane += ops.a[cursor[1]] * ops.b[cursor[2]];
                    advance(&mut cursor, &l.deltas);
                }
            }
            out[offsets[0]] += lanes[..width].iter().sum::<f32>();
        }
        Some(width) => {
            let mut lanes = [0.0f32; MAX_VECTOR_WIDTH];
            for _ in 0..l.extent / width {
                let mut load = cursor;
                for lane in lanes[..width].iter_mut() {
                    *lane = compute(body, out, ops, load);
                    advance(&mut load, &l.deltas);
                }
                for lane in &lanes[..width] {
                    out[cursor[0]] = *lane;
                    advance(&mut cursor, &l.deltas);
                }
            }
        }
        None => {
            for _ in 0..l.extent {
                out[cursor[0]] = compute(body, out, ops, cursor);
                advance(&mut cursor, &l.deltas);
            }
        }
    }
}

#[inline]
fn compute(body: Body, out: &[f32], ops: &Operands<'_>, [o, x, y]: [usize; OPERANDS]) -> f32 {
    match body {
        Body::MulAcc => out[o] + ops.a[x] * ops.b[y],
        Body::Add => ops.a[x] + ops.b[y],
        Body::Mul => ops.a[x] * ops.b[y],
        Body::Copy => ops.a[x],
    }
}

#[inline]
fn advance(cursor: &mut [usize; OPERANDS], deltas: &[usize; OPERANDS]) {
    for (c, d) in cursor.iter_mut().zip(deltas) {
        *c += d;
    }
}
