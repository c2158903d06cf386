//! Loop-nest kernel definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_type(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorSpec {
    pub fn new<N: Into<String>>(name: N, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    /// Row-major element strides.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for dim in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * self.shape[dim + 1];
        }
        strides
    }

    pub fn mlir_memref_type(&self) -> String {
        if self.shape.is_empty() {
            return format!("memref<{}>", self.dtype.element_type());
        }
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        format!("memref<{}x{}>", dims, self.dtype.element_type())
    }
}

/// Whether an iterator indexes the output or is summed away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IteratorKind {
    Parallel,
    Reduction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IteratorSpec {
    pub name: String,
    pub extent: usize,
    pub kind: IteratorKind,
}

/// One tensor operand of the statement: `tensors[tensor][iterators[0], ...]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TensorAccess {
    pub tensor: usize,
    pub indices: Vec<usize>,
}

impl TensorAccess {
    pub fn axis_of(&self, iterator: usize) -> Option<usize> {
        self.indices.iter().position(|&idx| idx == iterator)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Mul,
    Copy,
}

impl ElementwiseOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementwiseOp::Add => "add",
            ElementwiseOp::Mul => "mul",
            ElementwiseOp::Copy => "copy",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            ElementwiseOp::Add | ElementwiseOp::Mul => 2,
            ElementwiseOp::Copy => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Statement {
    /// `output += lhs * rhs`, summing over every iterator absent from `output`.
    Contraction {
        output: TensorAccess,
        lhs: TensorAccess,
        rhs: TensorAccess,
    },
    /// `output = op(inputs...)`.
    Elementwise {
        op: ElementwiseOp,
        output: TensorAccess,
        inputs: Vec<TensorAccess>,
    },
}

impl Statement {
    pub fn output(&self) -> &TensorAccess {
        match self {
            Statement::Contraction { output, .. } => output,
            Statement::Elementwise { output, .. } => output,
        }
    }

    /// Input operands in evaluation order.
    pub fn inputs(&self) -> Vec<&TensorAccess> {
        match self {
            Statement::Contraction { lhs, rhs, .. } => vec![lhs, rhs],
            Statement::Elementwise { inputs, .. } => inputs.iter().collect(),
        }
    }

    pub fn accesses(&self) -> Vec<&TensorAccess> {
        let mut accesses = vec![self.output()];
        accesses.extend(self.inputs());
        accesses
    }
}

/// A single loop of a nest.
///
/// The iterator value of a nest point is the sum of `index * stride` over every
/// loop bound to that iterator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Loop {
    pub iterator: usize,
    pub extent: usize,
    pub stride: usize,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_width: Option<usize>,
}

impl Loop {
    pub fn full(iterator: usize, extent: usize) -> Self {
        Self {
            iterator,
            extent,
            stride: 1,
            parallel: false,
            vector_width: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LoopNest {
    pub loops: Vec<Loop>,
}

impl LoopNest {
    /// Canonical nest: one unit-stride loop per iterator, in declaration order.
    pub fn identity(iterators: &[IteratorSpec]) -> Self {
        Self {
            loops: iterators
                .iter()
                .enumerate()
                .map(|(index, it)| Loop::full(index, it.extent))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn innermost(&self) -> Option<&Loop> {
        self.loops.last()
    }

    pub fn loops_for(&self, iterator: usize) -> impl Iterator<Item = &Loop> {
        self.loops.iter().filter(move |l| l.iterator == iterator)
    }

    /// Whether `loop_index` has the largest stride among its iterator's loops.
    pub fn is_outermost_level(&self, loop_index: usize) -> bool {
        let Some(target) = self.loops.get(loop_index) else {
            return false;
        };
        self.loops_for(target.iterator)
            .all(|other| other.stride <= target.stride)
    }

    /// Whether `loop_index` is a point loop left behind by tiling.
    pub fn is_tile_point(&self, loop_index: usize) -> bool {
        let Some(target) = self.loops.get(loop_index) else {
            return false;
        };
        self.loops_for(target.iterator)
            .any(|other| other.stride > target.stride)
    }

    pub fn parallel_loop(&self) -> Option<usize> {
        self.loops.iter().position(|l| l.parallel)
    }

    pub fn vector_loop(&self) -> Option<usize> {
        self.loops.iter().position(|l| l.vector_width.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Kernel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub tensors: Vec<TensorSpec>,
    pub iterators: Vec<IteratorSpec>,
    pub statement: Statement,
    pub nest: LoopNest,
}

impl Kernel {
    pub fn output_tensor(&self) -> &TensorSpec {
        &self.tensors[self.statement.output().tensor]
    }

    pub fn iterator_name(&self, iterator: usize) -> &str {
        self.iterators
            .get(iterator)
            .map(|it| it.name.as_str())
            .unwrap_or("?")
    }

    /// Number of multiply-add (or elementwise) points in the iteration space.
    pub fn iteration_points(&self) -> usize {
        self.iterators.iter().map(|it| it.extent).product()
    }

    pub fn flops(&self) -> f64 {
        let points = self.iteration_points() as f64;
        match &self.statement {
            Statement::Contraction { .. } => 2.0 * points,
            Statement::Elementwise { op, .. } => match op {
                ElementwiseOp::Copy => 0.0,
                _ => points,
            },
        }
    }

    /// Stable identity of the kernel state, used for de-duplication.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn schedule_summary(&self) -> String {
        NestDisplay { kernel: self }.to_string()
    }
}

struct NestDisplay<'a> {
    kernel: &'a Kernel,
}

impl fmt::Display for NestDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nest = &self.kernel.nest;
        for (index, l) in nest.loops.iter().enumerate() {
            if index > 0 {
                write!(f, " > ")?;
            }
            write!(f, "{}", self.kernel.iterator_name(l.iterator))?;
            if l.stride > 1 || nest.is_tile_point(index) {
                write!(f, "/{}", l.stride)?;
            }
            write!(f, "[{}", l.extent)?;
            if l.parallel {
                write!(f, " par")?;
            }
            if let Some(width) = l.vector_width {
                write!(f, " vec{}", width)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}
