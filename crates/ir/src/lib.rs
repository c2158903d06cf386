//! Loop-nest kernel IR for looptune.
//!
//! Kernels are single-statement affine loop nests. Transformations rewrite the
//! nest only; the statement and tensor layout stay fixed, so any legal nest
//! computes the same result as the canonical one.

pub mod builder;
pub mod dialect;
pub mod inputs;
pub mod legality;
pub mod transform;

pub use builder::*;
pub use dialect::*;
pub use inputs::*;
pub use legality::*;
pub use transform::*;
