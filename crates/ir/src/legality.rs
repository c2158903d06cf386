//! Structural legality of a transformed loop nest.
//!
//! A legal nest visits every point of the iteration space exactly once: for
//! each iterator, its loops sorted by stride must form a mixed-radix
//! decomposition of the iterator extent. Placement of the parallel and
//! vector loops is checked as well.

use crate::dialect::{IteratorKind, Kernel};
use crate::transform::MAX_VECTOR_WIDTH;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LegalityViolation {
    #[error("loop {index} references unknown iterator {iterator}")]
    UnknownIterator { index: usize, iterator: usize },
    #[error("iterator `{iterator}` has no loop")]
    MissingIterator { iterator: String },
    #[error("loops of iterator `{iterator}` do not cover its extent {extent} exactly once")]
    BrokenCoverage { iterator: String, extent: usize },
    #[error("nest has {count} parallel loops")]
    MultipleParallel { count: usize },
    #[error("parallel loop sits at position {index}")]
    MisplacedParallel { index: usize },
    #[error("parallel loop carries reduction iterator `{iterator}`")]
    ParallelReduction { iterator: String },
    #[error("nest has {count} vectorized loops")]
    MultipleVector { count: usize },
    #[error("vectorized loop sits at position {index}")]
    MisplacedVector { index: usize },
    #[error("vector width {width} does not fit extent {extent}")]
    BadVectorWidth { width: usize, extent: usize },
}

pub fn check_legality(kernel: &Kernel) -> Result<(), LegalityViolation> {
    let nest = &kernel.nest;

    for (index, l) in nest.loops.iter().enumerate() {
        if l.iterator >= kernel.iterators.len() {
            return Err(LegalityViolation::UnknownIterator {
                index,
                iterator: l.iterator,
            });
        }
    }

    for (iterator, spec) in kernel.iterators.iter().enumerate() {
        let mut levels: Vec<(usize, usize)> = nest
            .loops_for(iterator)
            .map(|l| (l.stride, l.extent))
            .collect();
        if levels.is_empty() {
            return Err(LegalityViolation::MissingIterator {
                iterator: spec.name.clone(),
            });
        }
        levels.sort_unstable();

        let mut expected_stride = 1usize;
        for (stride, extent) in levels {
            if stride != expected_stride || extent == 0 {
                return Err(LegalityViolation::BrokenCoverage {
                    iterator: spec.name.clone(),
                    extent: spec.extent,
                });
            }
            expected_stride = stride.saturating_mul(extent);
        }
        if expected_stride != spec.extent {
            return Err(LegalityViolation::BrokenCoverage {
                iterator: spec.name.clone(),
                extent: spec.extent,
            });
        }
    }

    let parallel: Vec<usize> = nest
        .loops
        .iter()
        .enumerate()
        .filter(|(_, l)| l.parallel)
        .map(|(i, _)| i)
        .collect();
    if parallel.len() > 1 {
        return Err(LegalityViolation::MultipleParallel {
            count: parallel.len(),
        });
    }
    if let Some(&index) = parallel.first() {
        if index != 0 || !nest.is_outermost_level(index) {
            return Err(LegalityViolation::MisplacedParallel { index });
        }
        let spec = &kernel.iterators[nest.loops[index].iterator];
        if spec.kind == IteratorKind::Reduction {
            return Err(LegalityViolation::ParallelReduction {
                iterator: spec.name.clone(),
            });
        }
    }

    let vector: Vec<usize> = nest
        .loops
        .iter()
        .enumerate()
        .filter(|(_, l)| l.vector_width.is_some())
        .map(|(i, _)| i)
        .collect();
    if vector.len() > 1 {
        return Err(LegalityViolation::MultipleVector {
            count: vector.len(),
        });
    }
    if let Some(&index) = vector.first() {
        if index + 1 != nest.len() || nest.loops[index].parallel {
            return Err(LegalityViolation::MisplacedVector { index });
        }
        let l = &nest.loops[index];
        let width = l.vector_width.unwrap_or(1);
        if !width.is_power_of_two() || width > MAX_VECTOR_WIDTH || l.extent % width != 0 {
            return Err(LegalityViolation::BadVectorWidth {
                width,
                extent: l.extent,
            });
        }
    }

    Ok(())
}
