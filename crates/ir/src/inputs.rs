//! Deterministic input tensors for running a kernel.

use crate::dialect::Kernel;
use ndarray::{ArrayD, IxDyn};

/// Seeded random values for every input tensor of a kernel.
///
/// The output tensor slot is left empty; executors allocate it per run.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInputs {
    pub seed: u64,
    tensors: Vec<Option<ArrayD<f32>>>,
}

impl KernelInputs {
    pub fn random(kernel: &Kernel, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let output = kernel.statement.output().tensor;
        let tensors = kernel
            .tensors
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                (index != output).then(|| {
                    ArrayD::from_shape_fn(IxDyn(&spec.shape), |_| rng.f32() * 2.0 - 1.0)
                })
            })
            .collect();
        Self { seed, tensors }
    }

    pub fn tensor(&self, index: usize) -> Option<&ArrayD<f32>> {
        self.tensors.get(index).and_then(|t| t.as_ref())
    }

    /// Whether these inputs match the tensor shapes of `kernel`.
    pub fn fits(&self, kernel: &Kernel) -> bool {
        let output = kernel.statement.output().tensor;
        self.tensors.len() == kernel.tensors.len()
            && kernel.tensors.iter().enumerate().all(|(index, spec)| {
                index == output
                    || self
                        .tensor(index)
                        .map(|t| t.shape() == spec.shape.as_slice())
                        .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{matmul, matvec};

    #[test]
    fn same_seed_gives_same_inputs() {
        let kernel = matmul("mm", 8, 4, 2);
        let a = KernelInputs::random(&kernel, 7);
        let b = KernelInputs::random(&kernel, 7);
        let c = KernelInputs::random(&kernel, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.tensor(2).is_none());
        assert_eq!(a.tensor(0).map(|t| t.shape().to_vec()), Some(vec![8, 2]));
        assert!(a.fits(&kernel));
        assert!(!a.fits(&matvec("mv", 8, 4)));
    }
}
