//! Kernel construction, module lookup and MLIR emission.

use crate::dialect::{
    DataType, ElementwiseOp, IteratorKind, IteratorSpec, Kernel, LoopNest, Statement,
    TensorAccess, TensorSpec,
};
use crate::legality::{check_legality, LegalityViolation};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("kernel `{0}` declares no iterators")]
    NoIterators(String),
    #[error("duplicate name `{0}`")]
    DuplicateName(String),
    #[error("iterator `{0}` has zero extent")]
    ZeroExtent(String),
    #[error("unknown tensor `{0}`")]
    UnknownTensor(String),
    #[error("unknown iterator `{0}`")]
    UnknownIterator(String),
    #[error("iterator `{iterator}` indexes tensor `{tensor}` more than once")]
    RepeatedIterator { tensor: String, iterator: String },
    #[error("tensor `{tensor}` has rank {rank} but is indexed by {indices} iterators")]
    RankMismatch {
        tensor: String,
        rank: usize,
        indices: usize,
    },
    #[error("tensor `{tensor}` dimension {axis} is {dim} but iterator `{iterator}` spans {extent}")]
    ExtentMismatch {
        tensor: String,
        axis: usize,
        dim: usize,
        iterator: String,
        extent: usize,
    },
    #[error("iterator `{0}` is never used by the statement")]
    UnusedIterator(String),
    #[error("output tensor `{0}` is also read as an input")]
    AliasedOutput(String),
    #[error("elementwise `{op}` takes {expected} inputs, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("elementwise statement cannot reduce over iterator `{0}`")]
    ElementwiseReduction(String),
    #[error("kernel `{0}` has no statement")]
    MissingStatement(String),
    #[error("iterator `{iterator}` is marked {declared:?} but the statement makes it {derived:?}")]
    IteratorKindMismatch {
        iterator: String,
        declared: IteratorKind,
        derived: IteratorKind,
    },
    #[error(transparent)]
    IllegalNest(#[from] LegalityViolation),
}

/// Named reference to `tensor[indices...]`, resolved at build time.
#[derive(Debug, Clone)]
pub struct AccessSpec {
    tensor: String,
    indices: Vec<String>,
}

pub fn access(tensor: &str, indices: &[&str]) -> AccessSpec {
    AccessSpec {
        tensor: tensor.to_string(),
        indices: indices.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Debug, Clone)]
enum PendingStatement {
    Contraction {
        output: AccessSpec,
        lhs: AccessSpec,
        rhs: AccessSpec,
    },
    Elementwise {
        op: ElementwiseOp,
        output: AccessSpec,
        inputs: Vec<AccessSpec>,
    },
}

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    name: String,
    tag: Option<String>,
    iterators: Vec<(String, usize)>,
    tensors: Vec<TensorSpec>,
    statement: Option<PendingStatement>,
}

impl KernelBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            tag: None,
            iterators: Vec::new(),
            tensors: Vec::new(),
            statement: None,
        }
    }

    pub fn tag<T: Into<String>>(mut self, tag: T) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn iterator(mut self, name: &str, extent: usize) -> Self {
        self.iterators.push((name.to_string(), extent));
        self
    }

    pub fn tensor(mut self, name: &str, shape: &[usize], dtype: DataType) -> Self {
        self.tensors.push(TensorSpec::new(name, shape.to_vec(), dtype));
        self
    }

    /// `output += lhs * rhs`.
    pub fn contraction(mut self, output: AccessSpec, lhs: AccessSpec, rhs: AccessSpec) -> Self {
        self.statement = Some(PendingStatement::Contraction { output, lhs, rhs });
        self
    }

    pub fn elementwise(
        mut self,
        op: ElementwiseOp,
        output: AccessSpec,
        inputs: Vec<AccessSpec>,
    ) -> Self {
        self.statement = Some(PendingStatement::Elementwise { op, output, inputs });
        self
    }

    pub fn build(self) -> Result<Kernel, BuildError> {
        if self.iterators.is_empty() {
            return Err(BuildError::NoIterators(self.name));
        }
        let mut names = BTreeSet::new();
        for (name, extent) in &self.iterators {
            if !names.insert(name.as_str()) {
                return Err(BuildError::DuplicateName(name.clone()));
            }
            if *extent == 0 {
                return Err(BuildError::ZeroExtent(name.clone()));
            }
        }
        for tensor in &self.tensors {
            if !names.insert(tensor.name.as_str()) {
                return Err(BuildError::DuplicateName(tensor.name.clone()));
            }
        }

        let pending = self
            .statement
            .clone()
            .ok_or_else(|| BuildError::MissingStatement(self.name.clone()))?;

        let statement = match &pending {
            PendingStatement::Contraction { output, lhs, rhs } => Statement::Contraction {
                output: self.resolve(output)?,
                lhs: self.resolve(lhs)?,
                rhs: self.resolve(rhs)?,
            },
            PendingStatement::Elementwise { op, output, inputs } => {
                if inputs.len() != op.arity() {
                    return Err(BuildError::Arity {
                        op: op.as_str(),
                        expected: op.arity(),
                        got: inputs.len(),
                    });
                }
                Statement::Elementwise {
                    op: *op,
                    output: self.resolve(output)?,
                    inputs: inputs
                        .iter()
                        .map(|input| self.resolve(input))
                        .collect::<Result<_, _>>()?,
                }
            }
        };

        let output = statement.output();
        if let Some(aliased) = statement
            .inputs()
            .iter()
            .find(|input| input.tensor == output.tensor)
        {
            return Err(BuildError::AliasedOutput(
                self.tensors[aliased.tensor].name.clone(),
            ));
        }

        let mut iterators = Vec::with_capacity(self.iterators.len());
        for (index, (name, extent)) in self.iterators.iter().enumerate() {
            let used = statement
                .accesses()
                .iter()
                .any(|a| a.indices.contains(&index));
            if !used {
                return Err(BuildError::UnusedIterator(name.clone()));
            }
            let kind = if output.indices.contains(&index) {
                IteratorKind::Parallel
            } else {
                IteratorKind::Reduction
            };
            if kind == IteratorKind::Reduction && matches!(statement, Statement::Elementwise { .. })
            {
                return Err(BuildError::ElementwiseReduction(name.clone()));
            }
            iterators.push(IteratorSpec {
                name: name.clone(),
                extent: *extent,
                kind,
            });
        }

        let nest = LoopNest::identity(&iterators);
        Ok(Kernel {
            name: self.name,
            tag: self.tag,
            tensors: self.tensors,
            iterators,
            statement,
            nest,
        })
    }

    fn resolve(&self, spec: &AccessSpec) -> Result<TensorAccess, BuildError> {
        let tensor = self
            .tensors
            .iter()
            .position(|t| t.name == spec.tensor)
            .ok_or_else(|| BuildError::UnknownTensor(spec.tensor.clone()))?;
        let tensor_spec = &self.tensors[tensor];
        if tensor_spec.shape.len() != spec.indices.len() {
            return Err(BuildError::RankMismatch {
                tensor: spec.tensor.clone(),
                rank: tensor_spec.shape.len(),
                indices: spec.indices.len(),
            });
        }

        let mut indices = Vec::with_capacity(spec.indices.len());
        for (axis, name) in spec.indices.iter().enumerate() {
            let iterator = self
                .iterators
                .iter()
                .position(|(it, _)| it == name)
                .ok_or_else(|| BuildError::UnknownIterator(name.clone()))?;
            if indices.contains(&iterator) {
                return Err(BuildError::RepeatedIterator {
                    tensor: spec.tensor.clone(),
                    iterator: name.clone(),
                });
            }
            let extent = self.iterators[iterator].1;
            if tensor_spec.shape[axis] != extent {
                return Err(BuildError::ExtentMismatch {
                    tensor: spec.tensor.clone(),
                    axis,
                    dim: tensor_spec.shape[axis],
                    iterator: name.clone(),
                    extent,
                });
            }
            indices.push(iterator);
        }

        Ok(TensorAccess { tensor, indices })
    }
}

/// Check a kernel that did not come out of [`KernelBuilder`], such as one
/// deserialized from a module file.
///
/// Index-based accesses are checked against the tensor and iterator tables,
/// then the nest must be legal. A kernel that passes can be planned and run
/// without out-of-bounds indexing.
pub fn validate_kernel(kernel: &Kernel) -> Result<(), BuildError> {
    if kernel.iterators.is_empty() {
        return Err(BuildError::NoIterators(kernel.name.clone()));
    }
    let mut names = BTreeSet::new();
    for spec in &kernel.iterators {
        if !names.insert(spec.name.as_str()) {
            return Err(BuildError::DuplicateName(spec.name.clone()));
        }
        if spec.extent == 0 {
            return Err(BuildError::ZeroExtent(spec.name.clone()));
        }
    }
    for tensor in &kernel.tensors {
        if !names.insert(tensor.name.as_str()) {
            return Err(BuildError::DuplicateName(tensor.name.clone()));
        }
    }

    let statement = &kernel.statement;
    if let Statement::Elementwise { op, inputs, .. } = statement {
        if inputs.len() != op.arity() {
            return Err(BuildError::Arity {
                op: op.as_str(),
                expected: op.arity(),
                got: inputs.len(),
            });
        }
    }
    for access in statement.accesses() {
        check_access(kernel, access)?;
    }

    let output = statement.output();
    if let Some(aliased) = statement
        .inputs()
        .iter()
        .find(|input| input.tensor == output.tensor)
    {
        return Err(BuildError::AliasedOutput(
            kernel.tensors[aliased.tensor].name.clone(),
        ));
    }

    for (index, spec) in kernel.iterators.iter().enumerate() {
        if !statement.accesses().iter().any(|a| a.indices.contains(&index)) {
            return Err(BuildError::UnusedIterator(spec.name.clone()));
        }
        let derived = if output.indices.contains(&index) {
            IteratorKind::Parallel
        } else {
            IteratorKind::Reduction
        };
        if derived != spec.kind {
            return Err(BuildError::IteratorKindMismatch {
                iterator: spec.name.clone(),
                declared: spec.kind,
                derived,
            });
        }
        if derived == IteratorKind::Reduction && matches!(statement, Statement::Elementwise { .. })
        {
            return Err(BuildError::ElementwiseReduction(spec.name.clone()));
        }
    }

    check_legality(kernel)?;
    Ok(())
}

fn check_access(kernel: &Kernel, access: &TensorAccess) -> Result<(), BuildError> {
    let tensor = kernel
        .tensors
        .get(access.tensor)
        .ok_or_else(|| BuildError::UnknownTensor(format!("#{}", access.tensor)))?;
    if tensor.shape.len() != access.indices.len() {
        return Err(BuildError::RankMismatch {
            tensor: tensor.name.clone(),
            rank: tensor.shape.len(),
            indices: access.indices.len(),
        });
    }
    for (axis, &iterator) in access.indices.iter().enumerate() {
        let spec = kernel
            .iterators
            .get(iterator)
            .ok_or_else(|| BuildError::UnknownIterator(format!("#{}", iterator)))?;
        if access.indices[..axis].contains(&iterator) {
            return Err(BuildError::RepeatedIterator {
                tensor: tensor.name.clone(),
                iterator: spec.name.clone(),
            });
        }
        if tensor.shape[axis] != spec.extent {
            return Err(BuildError::ExtentMismatch {
                tensor: tensor.name.clone(),
                axis,
                dim: tensor.shape[axis],
                iterator: spec.name.clone(),
                extent: spec.extent,
            });
        }
    }
    Ok(())
}

// Canonical kernels. Shapes are consistent by construction, so these skip the
// builder's validation.

fn assemble(
    name: &str,
    tag: &str,
    iterators: Vec<IteratorSpec>,
    tensors: Vec<TensorSpec>,
    statement: Statement,
) -> Kernel {
    let nest = LoopNest::identity(&iterators);
    Kernel {
        name: name.to_string(),
        tag: Some(tag.to_string()),
        tensors,
        iterators,
        statement,
        nest,
    }
}

fn iter(name: &str, extent: usize, kind: IteratorKind) -> IteratorSpec {
    IteratorSpec {
        name: name.to_string(),
        extent,
        kind,
    }
}

fn at(tensor: usize, indices: &[usize]) -> TensorAccess {
    TensorAccess {
        tensor,
        indices: indices.to_vec(),
    }
}

/// `C[i, j] += A[i, k] * B[k, j]` with `A: m x k`, `B: k x n`.
pub fn matmul(name: &str, m: usize, n: usize, k: usize) -> Kernel {
    assemble(
        name,
        "matmul",
        vec![
            iter("i", m, IteratorKind::Parallel),
            iter("j", n, IteratorKind::Parallel),
            iter("k", k, IteratorKind::Reduction),
        ],
        vec![
            TensorSpec::new("A", vec![m, k], DataType::F32),
            TensorSpec::new("B", vec![k, n], DataType::F32),
            TensorSpec::new("C", vec![m, n], DataType::F32),
        ],
        Statement::Contraction {
            output: at(2, &[0, 1]),
            lhs: at(0, &[0, 2]),
            rhs: at(1, &[2, 1]),
        },
    )
}

/// `y[i] += A[i, k] * x[k]`.
pub fn matvec(name: &str, m: usize, n: usize) -> Kernel {
    assemble(
        name,
        "matvec",
        vec![
            iter("i", m, IteratorKind::Parallel),
            iter("k", n, IteratorKind::Reduction),
        ],
        vec![
            TensorSpec::new("A", vec![m, n], DataType::F32),
            TensorSpec::new("x", vec![n], DataType::F32),
            TensorSpec::new("y", vec![m], DataType::F32),
        ],
        Statement::Contraction {
            output: at(2, &[0]),
            lhs: at(0, &[0, 1]),
            rhs: at(1, &[1]),
        },
    )
}

/// `B[j, i] = A[i, j]`.
pub fn transpose(name: &str, m: usize, n: usize) -> Kernel {
    assemble(
        name,
        "transpose",
        vec![
            iter("i", m, IteratorKind::Parallel),
            iter("j", n, IteratorKind::Parallel),
        ],
        vec![
            TensorSpec::new("A", vec![m, n], DataType::F32),
            TensorSpec::new("B", vec![n, m], DataType::F32),
        ],
        Statement::Elementwise {
            op: ElementwiseOp::Copy,
            output: at(1, &[1, 0]),
            inputs: vec![at(0, &[0, 1])],
        },
    )
}

/// `C[i, j] = A[i, j] + B[i, j]`.
pub fn add(name: &str, m: usize, n: usize) -> Kernel {
    assemble(
        name,
        "add",
        vec![
            iter("i", m, IteratorKind::Parallel),
            iter("j", n, IteratorKind::Parallel),
        ],
        vec![
            TensorSpec::new("A", vec![m, n], DataType::F32),
            TensorSpec::new("B", vec![m, n], DataType::F32),
            TensorSpec::new("C", vec![m, n], DataType::F32),
        ],
        Statement::Elementwise {
            op: ElementwiseOp::Add,
            output: at(2, &[0, 1]),
            inputs: vec![at(0, &[0, 1]), at(1, &[0, 1])],
        },
    )
}

/// A compilation unit holding one or more kernels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KernelModule {
    pub kernels: Vec<Kernel>,
}

impl KernelModule {
    pub fn new(kernels: Vec<Kernel>) -> Self {
        Self { kernels }
    }

    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Find the kernel defined by function `name`.
    pub fn locate(&self, name: &str) -> Option<&Kernel> {
        self.kernels.iter().find(|k| k.name == name)
    }

    /// Find the first kernel carrying `tag`.
    pub fn locate_tagged(&self, tag: &str) -> Option<&Kernel> {
        self.kernels
            .iter()
            .find(|k| k.tag.as_deref() == Some(tag))
    }

    pub fn replace(&mut self, kernel: Kernel) -> bool {
        match self.kernels.iter_mut().find(|k| k.name == kernel.name) {
            Some(slot) => {
                *slot = kernel;
                true
            }
            None => false,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading kernel module {}", path.display()))?;
        let module: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing kernel module {}", path.display()))?;
        for kernel in &module.kernels {
            validate_kernel(kernel).with_context(|| {
                format!("invalid kernel `{}` in {}", kernel.name, path.display())
            })?;
        }
        Ok(module)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn to_mlir_text(&self) -> String {
        let mut text = String::from("module {\n");
        for kernel in &self.kernels {
            text.push_str(&emit_kernel_function(kernel));
        }
        text.push_str("}\n");
        text
    }

    #[cfg(feature = "mlir")]
    pub fn validate_mlir(&self) -> Result<()> {
        validate_mlir_text(&self.to_mlir_text())
    }
}

#[cfg(feature = "mlir")]
pub fn validate_mlir_text(text: &str) -> Result<()> {
    use melior::dialect::DialectRegistry;
    use melior::ir::Module;
    use melior::utility::register_all_dialects;
    use melior::Context;

    let registry = DialectRegistry::new();
    register_all_dialects(&registry);

    let context = Context::new();
    context.append_dialect_registry(&registry);
    context.load_all_available_dialects();

    if Module::parse(&context, text).is_none() {
        anyhow::bail!("failed to parse MLIR module");
    }
    Ok(())
}

/// Render one kernel as a `func.func` over memrefs with an explicit loop nest.
pub fn emit_kernel_function(kernel: &Kernel) -> String {
    let mut body = String::new();
    let args = kernel
        .tensors
        .iter()
        .enumerate()
        .map(|(index, t)| format!("%arg{}: {}", index, t.mlir_memref_type()))
        .collect::<Vec<_>>()
        .join(", ");

    let _ = writeln!(
        body,
        "  func.func @{}({}) attributes {{looptune.schedule = \"{}\"}} {{",
        kernel.name,
        args,
        kernel.schedule_summary()
    );

    let mut constants = BTreeSet::new();
    constants.insert(0usize);
    constants.insert(1usize);
    for l in &kernel.nest.loops {
        constants.insert(l.extent);
        constants.insert(l.stride);
    }
    for value in &constants {
        let _ = writeln!(body, "    %c{} = arith.constant {} : index", value, value);
    }

    let mut indent = 4;
    for (pos, l) in kernel.nest.loops.iter().enumerate() {
        let pad = " ".repeat(indent);
        if l.parallel {
            let _ = writeln!(
                body,
                "{}scf.parallel (%l{}) = (%c0) to (%c{}) step (%c1) {{",
                pad, pos, l.extent
            );
        } else {
            let _ = writeln!(
                body,
                "{}scf.for %l{} = %c0 to %c{} step %c1 {{",
                pad, pos, l.extent
            );
        }
        indent += 2;
    }

    let pad = " ".repeat(indent);
    let values = emit_iterator_values(kernel, &pad, &mut body);
    emit_statement(kernel, &values, &pad, &mut body);

    for l in kernel.nest.loops.iter().rev() {
        indent -= 2;
        let pad = " ".repeat(indent);
        match l.vector_width {
            Some(width) => {
                let _ = writeln!(body, "{}}} {{looptune.vector_width = {} : i64}}", pad, width);
            }
            None => {
                let _ = writeln!(body, "{}}}", pad);
            }
        }
    }

    body.push_str("    return\n");
    body.push_str("  }\n");
    body
}

/// Emit `sum(l_p * stride_p)` for every iterator and return the SSA names.
fn emit_iterator_values(kernel: &Kernel, pad: &str, body: &mut String) -> Vec<String> {
    let mut values = Vec::with_capacity(kernel.iterators.len());
    for iterator in 0..kernel.iterators.len() {
        let mut terms = Vec::new();
        for (pos, l) in kernel.nest.loops.iter().enumerate() {
            if l.iterator != iterator {
                continue;
            }
            if l.stride == 1 {
                terms.push(format!("%l{}", pos));
            } else {
                let _ = writeln!(
                    body,
                    "{}%t{} = arith.muli %l{}, %c{} : index",
                    pad, pos, pos, l.stride
                );
                terms.push(format!("%t{}", pos));
            }
        }

        let mut current = terms.first().cloned().unwrap_or_else(|| "%c0".to_string());
        for (n, term) in terms.iter().enumerate().skip(1) {
            let name = format!("%iv{}_{}", iterator, n);
            let _ = writeln!(body, "{}{} = arith.addi {}, {} : index", pad, name, current, term);
            current = name;
        }
        values.push(current);
    }
    values
}

fn emit_statement(kernel: &Kernel, values: &[String], pad: &str, body: &mut String) {
    let subscript = |access: &TensorAccess| {
        access
            .indices
            .iter()
            .map(|&it| values[it].clone())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let memref = |access: &TensorAccess| kernel.tensors[access.tensor].mlir_memref_type();
    let element = kernel.output_tensor().dtype.element_type();

    let load = |name: &str, access: &TensorAccess, body: &mut String| {
        let _ = writeln!(
            body,
            "{}%{} = memref.load %arg{}[{}] : {}",
            pad,
            name,
            access.tensor,
            subscript(access),
            memref(access)
        );
    };

    let output = kernel.statement.output();
    let result = match &kernel.statement {
        Statement::Contraction { lhs, rhs, .. } => {
            load("lhs", lhs, body);
            load("rhs", rhs, body);
            load("acc", output, body);
            let _ = writeln!(body, "{}%prod = arith.mulf %lhs, %rhs : {}", pad, element);
            let _ = writeln!(body, "{}%sum = arith.addf %acc, %prod : {}", pad, element);
            "%sum"
        }
        Statement::Elementwise { op, inputs, .. } => {
            for (n, input) in inputs.iter().enumerate() {
                load(&format!("in{}", n), input, body);
            }
            match op {
                ElementwiseOp::Copy => "%in0",
                ElementwiseOp::Add => {
                    let _ = writeln!(body, "{}%res = arith.addf %in0, %in1 : {}", pad, element);
                    "%res"
                }
                ElementwiseOp::Mul => {
                    let _ = writeln!(body, "{}%res = arith.mulf %in0, %in1 : {}", pad, element);
                    "%res"
                }
            }
        }
    };

    let _ = writeln!(
        body,
        "{}memref.store {}, %arg{}[{}] : {}",
        pad,
        result,
        output.tensor,
        subscript(output),
        memref(output)
    );
}

pub fn tensor(name: &str, shape: &[usize], dtype: DataType) -> TensorSpec {
    TensorSpec::new(name, shape.to_vec(), dtype)
}
