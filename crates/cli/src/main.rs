//! Command-line entry point for looptune.

use anyhow::Result;
use clap::Parser;
use looptune_driver::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
