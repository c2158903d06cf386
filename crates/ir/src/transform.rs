//! Parameterized loop-nest rewrites.
//!
//! [`apply_edit`] is the single entry point: it takes a kernel and one
//! [`TransformDescriptor`] and either produces a fresh kernel or explains why
//! the parameter choice does not fit the current nest. Rejections are an
//! expected part of enumerating a design space, not failures.

use crate::dialect::{IteratorKind, Kernel, Loop, LoopNest};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest vector width any edit may request.
pub const MAX_VECTOR_WIDTH: usize = 16;

/// The four transformation families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    Tiling,
    Interchange,
    Parallelization,
    Vectorization,
}

/// One concrete rewrite: a kind plus its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransformDescriptor {
    /// Split loop `loop_index` into a tile loop and a point loop of `size`.
    Tile { loop_index: usize, size: usize },
    /// New position `i` holds the loop previously at `permutation[i]`.
    Interchange { permutation: Vec<usize> },
    Parallelize { loop_index: usize },
    /// Vectorize the innermost loop.
    Vectorize { width: usize },
}

impl TransformDescriptor {
    pub fn kind(&self) -> TransformKind {
        match self {
            TransformDescriptor::Tile { .. } => TransformKind::Tiling,
            TransformDescriptor::Interchange { .. } => TransformKind::Interchange,
            TransformDescriptor::Parallelize { .. } => TransformKind::Parallelization,
            TransformDescriptor::Vectorize { .. } => TransformKind::Vectorization,
        }
    }

    /// Permutation exchanging two loop positions of a nest with `depth` loops.
    pub fn swap(depth: usize, a: usize, b: usize) -> Self {
        let mut permutation: Vec<usize> = (0..depth).collect();
        if a < depth && b < depth {
            permutation.swap(a, b);
        }
        TransformDescriptor::Interchange { permutation }
    }
}

impl fmt::Display for TransformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformDescriptor::Tile { loop_index, size } => {
                write!(f, "tile(loop={}, size={})", loop_index, size)
            }
            TransformDescriptor::Interchange { permutation } => {
                let perm = permutation
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "interchange([{}])", perm)
            }
            TransformDescriptor::Parallelize { loop_index } => {
                write!(f, "parallelize(loop={})", loop_index)
            }
            TransformDescriptor::Vectorize { width } => write!(f, "vectorize(width={})", width),
        }
    }
}

/// Structural reasons an edit does not apply to a nest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejected {
    #[error("loop {index} is out of range for a nest of depth {depth}")]
    LoopOutOfRange { index: usize, depth: usize },
    #[error("loop {index} is already {reason}")]
    LoopConsumed { index: usize, reason: &'static str },
    #[error("tile size {size} is degenerate")]
    DegenerateTile { size: usize },
    #[error("tile size {size} does not fit inside loop extent {extent}")]
    TileExceedsExtent { size: usize, extent: usize },
    #[error("tile size {size} does not evenly divide loop extent {extent}")]
    TileNotDivisor { size: usize, extent: usize },
    #[error("permutation is not a bijection over {depth} loops")]
    NotBijection { depth: usize },
    #[error("permutation is the identity")]
    IdentityPermutation,
    #[error("permutation moves the {what} loop")]
    PinnedLoopMoved { what: &'static str },
    #[error("nest already has a parallel loop")]
    AlreadyParallel,
    #[error("only the outermost loop can be parallelized, got loop {index}")]
    NotOutermost { index: usize },
    #[error("iterator `{iterator}` carries a reduction")]
    CarriesReduction { iterator: String },
    #[error("loop {index} is not the outermost level of its iterator")]
    InnerTileLevel { index: usize },
    #[error("nest already has a vectorized loop")]
    AlreadyVectorized,
    #[error("innermost loop has not been fixed by tiling")]
    InnermostNotTiled,
    #[error("vector width {width} is not usable for extent {extent}")]
    VectorWidth { width: usize, extent: usize },
    #[error("nest has no loops")]
    EmptyNest,
}

/// Apply one edit to `kernel`, returning an independent copy.
pub fn apply_edit(kernel: &Kernel, edit: &TransformDescriptor) -> Result<Kernel, Rejected> {
    let nest = match edit {
        TransformDescriptor::Tile { loop_index, size } => tile(&kernel.nest, *loop_index, *size)?,
        TransformDescriptor::Interchange { permutation } => {
            interchange(&kernel.nest, permutation)?
        }
        TransformDescriptor::Parallelize { loop_index } => {
            parallelize(kernel, *loop_index)?
        }
        TransformDescriptor::Vectorize { width } => vectorize(&kernel.nest, *width)?,
    };

    Ok(Kernel {
        nest,
        ..kernel.clone()
    })
}

/// Re-apply a recorded history on top of `kernel`.
pub fn replay<'a, I>(kernel: &Kernel, history: I) -> Result<Kernel, (usize, Rejected)>
where
    I: IntoIterator<Item = &'a TransformDescriptor>,
{
    let mut current = kernel.clone();
    for (step, edit) in history.into_iter().enumerate() {
        current = apply_edit(&current, edit).map_err(|err| (step, err))?;
    }
    Ok(current)
}

fn loop_at(nest: &LoopNest, index: usize) -> Result<&Loop, Rejected> {
    nest.loops.get(index).ok_or(Rejected::LoopOutOfRange {
        index,
        depth: nest.len(),
    })
}

fn tile(nest: &LoopNest, index: usize, size: usize) -> Result<LoopNest, Rejected> {
    let target = loop_at(nest, index)?;
    if target.parallel {
        return Err(Rejected::LoopConsumed {
            index,
            reason: "parallel",
        });
    }
    if target.vector_width.is_some() {
        return Err(Rejected::LoopConsumed {
            index,
            reason: "vectorized",
        });
    }
    if size < 2 {
        return Err(Rejected::DegenerateTile { size });
    }
    if size >= target.extent {
        return Err(Rejected::TileExceedsExtent {
            size,
            extent: target.extent,
        });
    }
    if target.extent % size != 0 {
        return Err(Rejected::TileNotDivisor {
            size,
            extent: target.extent,
        });
    }

    let outer = Loop {
        extent: target.extent / size,
        stride: target.stride * size,
        ..target.clone()
    };
    let point = Loop {
        extent: size,
        ..target.clone()
    };

    let mut loops = nest.loops.clone();
    loops[index] = outer;
    loops.insert(index + 1, point);
    Ok(LoopNest { loops })
}

fn interchange(nest: &LoopNest, permutation: &[usize]) -> Result<LoopNest, Rejected> {
    let depth = nest.len();
    if permutation.len() != depth {
        return Err(Rejected::NotBijection { depth });
    }
    let mut seen = vec![false; depth];
    for &p in permutation {
        if p >= depth || seen[p] {
            return Err(Rejected::NotBijection { depth });
        }
        seen[p] = true;
    }
    if permutation.iter().enumerate().all(|(i, &p)| i == p) {
        return Err(Rejected::IdentityPermutation);
    }
    if let Some(parallel) = nest.parallel_loop() {
        if permutation[parallel] != parallel {
            return Err(Rejected::PinnedLoopMoved { what: "parallel" });
        }
    }
    if let Some(vector) = nest.vector_loop() {
        if permutation[vector] != vector {
            return Err(Rejected::PinnedLoopMoved { what: "vectorized" });
        }
    }

    Ok(LoopNest {
        loops: permutation.iter().map(|&p| nest.loops[p].clone()).collect(),
    })
}

fn parallelize(kernel: &Kernel, index: usize) -> Result<LoopNest, Rejected> {
    let nest = &kernel.nest;
    let target = loop_at(nest, index)?;
    if nest.parallel_loop().is_some() {
        return Err(Rejected::AlreadyParallel);
    }
    if index != 0 {
        return Err(Rejected::NotOutermost { index });
    }
    if target.vector_width.is_some() {
        return Err(Rejected::LoopConsumed {
            index,
            reason: "vectorized",
        });
    }
    let iterator = &kernel.iterators[target.iterator];
    if iterator.kind == IteratorKind::Reduction {
        return Err(Rejected::CarriesReduction {
            iterator: iterator.name.clone(),
        });
    }
    if !nest.is_outermost_level(index) {
        return Err(Rejected::InnerTileLevel { index });
    }

    let mut next = nest.clone();
    next.loops[index].parallel = true;
    Ok(next)
}

fn vectorize(nest: &LoopNest, width: usize) -> Result<LoopNest, Rejected> {
    if nest.vector_loop().is_some() {
        return Err(Rejected::AlreadyVectorized);
    }
    let index = nest.len().checked_sub(1).ok_or(Rejected::EmptyNest)?;
    let target = &nest.loops[index];
    if target.parallel {
        return Err(Rejected::LoopConsumed {
            index,
            reason: "parallel",
        });
    }
    if !nest.is_tile_point(index) {
        return Err(Rejected::InnermostNotTiled);
    }
    if !width.is_power_of_two()
        || width < 2
        || width > MAX_VECTOR_WIDTH
        || width > target.extent
        || target.extent % width != 0
    {
        return Err(Rejected::VectorWidth {
            width,
            extent: target.extent,
        });
    }

    let mut next = nest.clone();
    next.loops[index].vector_width = Some(width);
    Ok(next)
}
