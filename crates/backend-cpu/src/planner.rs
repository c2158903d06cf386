//! Lowering of a loop nest into a flat execution plan.
//!
//! Every tensor is row-major, so advancing one loop by one step moves each
//! operand by a fixed number of elements. The plan stores those deltas per loop
//! and per operand; the runtime only adds offsets.

use looptune_ir::{
    validate_kernel, DataType, ElementwiseOp, Kernel, Statement, TensorAccess, TensorSpec,
};
use looptune_search::ExecutionError;

/// Operand slots: output first, then up to two inputs.
pub const OPERANDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// `out += a * b`
    MulAcc,
    Add,
    Mul,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLoop {
    pub extent: usize,
    pub deltas: [usize; OPERANDS],
    pub vector_width: Option<usize>,
}

/// How the parallel outer loop partitions the output.
///
/// Iteration `t` writes exactly the output slab `[t * chunk, (t + 1) * chunk)`
/// along `axis`, so slabs can be computed independently and stitched back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelSplit {
    pub extent: usize,
    pub axis: usize,
    pub chunk: usize,
    pub slab_shape: Vec<usize>,
    /// Per-iteration advance of the input operands.
    pub input_deltas: [usize; OPERANDS],
    /// Inner loops with output deltas expressed in slab layout.
    pub slab_loops: Vec<PlannedLoop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKernel {
    pub name: String,
    pub body: Body,
    /// Tensor index feeding each input slot.
    pub inputs: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub loops: Vec<PlannedLoop>,
    pub parallel: Option<ParallelSplit>,
}

impl CompiledKernel {
    pub fn output_len(&self) -> usize {
        self.output_shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPlanner;

impl CpuPlanner {
    pub fn compile(&self, kernel: &Kernel) -> Result<CompiledKernel, ExecutionError> {
        if let Some(tensor) = kernel.tensors.iter().find(|t| t.dtype != DataType::F32) {
            return Err(ExecutionError::Compile(format!(
                "tensor `{}` has unsupported element type {}",
                tensor.name,
                tensor.dtype.element_type()
            )));
        }
        validate_kernel(kernel).map_err(|err| ExecutionError::Compile(err.to_string()))?;

        let statement = &kernel.statement;
        let output = statement.output();
        let inputs = statement.inputs();
        let body = match statement {
            Statement::Contraction { .. } => Body::MulAcc,
            Statement::Elementwise { op, .. } => match op {
                ElementwiseOp::Add => Body::Add,
                ElementwiseOp::Mul => Body::Mul,
                ElementwiseOp::Copy => Body::Copy,
            },
        };

        let output_spec = &kernel.tensors[output.tensor];
        let output_strides = output_spec.strides();
        let input_strides: Vec<Vec<usize>> = inputs
            .iter()
            .map(|access| kernel.tensors[access.tensor].strides())
            .collect();

        let loops: Vec<PlannedLoop> = kernel
            .nest
            .loops
            .iter()
            .map(|l| {
                let mut deltas = [0usize; OPERANDS];
                deltas[0] = delta(output, &output_strides, l.iterator, l.stride);
                for (slot, access) in inputs.iter().enumerate() {
                    deltas[slot + 1] = delta(access, &input_strides[slot], l.iterator, l.stride);
                }
                PlannedLoop {
                    extent: l.extent,
                    deltas,
                    vector_width: l.vector_width,
                }
            })
            .collect();

        let parallel = match kernel.nest.parallel_loop() {
            Some(index) => Some(plan_split(kernel, output, output_spec, &loops, index)?),
            None => None,
        };

        Ok(CompiledKernel {
            name: kernel.name.clone(),
            body,
            inputs: inputs.iter().map(|access| access.tensor).collect(),
            output_shape: output_spec.shape.clone(),
            loops,
            parallel,
        })
    }
}

fn delta(access: &TensorAccess, strides: &[usize], iterator: usize, stride: usize) -> usize {
    access
        .axis_of(iterator)
        .map(|axis| strides[axis] * stride)
        .unwrap_or(0)
}

fn plan_split(
    kernel: &Kernel,
    output: &TensorAccess,
    output_spec: &TensorSpec,
    loops: &[PlannedLoop],
    index: usize,
) -> Result<ParallelSplit, ExecutionError> {
    let outer = &kernel.nest.loops[index];
    if index != 0 {
        return Err(ExecutionError::Compile(format!(
            "parallel loop at position {} is not outermost",
            index
        )));
    }
    let axis = output.axis_of(outer.iterator).ok_or_else(|| {
        ExecutionError::Compile(format!(
            "parallel iterator `{}` does not index the output",
            kernel.iterator_name(outer.iterator)
        ))
    })?;

    let mut slab_shape = output_spec.shape.clone();
    slab_shape[axis] = outer.stride;
    let slab_strides = TensorSpec::new("slab", slab_shape.clone(), DataType::F32).strides();

    let slab_loops = kernel.nest.loops[1..]
        .iter()
        .zip(&loops[1..])
        .map(|(l, planned)| {
            let mut deltas = planned.deltas;
            deltas[0] = delta(output, &slab_strides, l.iterator, l.stride);
            PlannedLoop {
                deltas,
                ..planned.clone()
            }
        })
        .collect();

    let mut input_deltas = loops[0].deltas;
    input_deltas[0] = 0;

    Ok(ParallelSplit {
        extent: outer.extent,
        axis,
        chunk: outer.stride,
        slab_shape,
        input_deltas,
        slab_loops,
    })
}
