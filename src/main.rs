mod app;
mod associations;
mod backup;
mod cli;
mod config;
mod error;
mod resolver;
mod scanner;
mod store;
mod sync;

use anyhow::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    cli::run()
}
