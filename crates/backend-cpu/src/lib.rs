//! Native CPU backend for looptune.
//!
//! Implements the `compile_and_run` primitive: a legal loop nest is lowered to
//! per-loop offset deltas and executed directly, with the parallel outer loop
//! spread over rayon workers.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
