//! Reference kernels used by the CLI when no module file is given.

use anyhow::Result;
use looptune_ir::{
    access, add, matmul, matvec, transpose, DataType, ElementwiseOp, KernelBuilder, KernelModule,
};

/// A small decoder-block shaped module: projections, a transpose, a residual
/// add and a scaling multiply.
pub fn sample_module() -> Result<KernelModule> {
    let gate = KernelBuilder::new("gate_mul")
        .tag("gate")
        .iterator("i", 128)
        .iterator("j", 256)
        .tensor("X", &[128, 256], DataType::F32)
        .tensor("G", &[128, 256], DataType::F32)
        .tensor("Y", &[128, 256], DataType::F32)
        .elementwise(
            ElementwiseOp::Mul,
            access("Y", &["i", "j"]),
            vec![access("X", &["i", "j"]), access("G", &["i", "j"])],
        )
        .build()?;

    Ok(KernelModule::default()
        .with_kernel(matmul("q_proj", 128, 128, 256))
        .with_kernel(matvec("decode_proj", 256, 256))
        .with_kernel(transpose("k_transpose", 128, 64))
        .with_kernel(add("residual_add", 128, 256))
        .with_kernel(gate))
}
