//! looptune: execution-driven autotuning of loop-nest kernels.
//!
//! Re-exports the workspace crates under one roof.

pub use looptune_backend_cpu as backend_cpu;
pub use looptune_driver as driver;
pub use looptune_ir as ir;
pub use looptune_search as search;
