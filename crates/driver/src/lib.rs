//! looptune driver facade.

#[cfg(feature = "cli")]
pub mod cli;
pub mod pipeline;
pub mod report;
pub mod samples;
pub mod script;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use pipeline::*;
pub use report::*;
pub use samples::*;
pub use script::*;
pub use session::*;
