//! Search core for looptune.
//!
//! A [`SearchStrategy`] explores sequences of loop transformations starting
//! from a root kernel. Candidates are produced by [`TransformationAction`]s
//! and scored by an [`Evaluator`], normally an [`ExecutionOracle`] that runs
//! each candidate on an [`ExecutionBackend`].

pub mod action;
pub mod beam;
pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod oracle;
pub mod strategy;

pub use action::*;
pub use beam::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use node::*;
pub use oracle::*;
pub use strategy::*;
