//! Executor agent entry point.
//!
//! Finds the server through the uri file (or `--server-addr`), registers,
//! and runs stages until drained.

use clap::Parser;

use pydpiper::config::{self, ExecutorOptions};
use pydpiper::{executor, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_site_defaults();
    let opts = ExecutorOptions::parse();
    logging::init(opts.verbose, None)?;

    executor::run_executor(opts).await?;
    Ok(())
}
