//! Main entry point for the pipeline server.
//!
//! Loads a JSON pipeline description, recognizes previously completed
//! stages from the completion log, serves the executor bridge, and exits 0
//! only when every stage finished.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use pydpiper::config::{self, QueueType, ServerOptions};
use pydpiper::pipeline::Pipeline;
use pydpiper::stage::PipelineSpec;
use pydpiper::{logging, server, StageDag};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    config::load_site_defaults();
    let opts = ServerOptions::parse();

    // On PBS the server's stdout disappears with the batch job, so keep a
    // copy in the working directory.
    let server_log = (opts.queue_type == QueueType::Pbs).then(|| opts.server_log_file());
    logging::init(opts.verbose, server_log.as_deref())?;

    let stages_path = opts
        .stages
        .clone()
        .context("no pipeline description; pass --stages <file.json>")?;
    let text = std::fs::read_to_string(&stages_path)
        .with_context(|| format!("reading pipeline description {}", stages_path.display()))?;
    let spec: PipelineSpec = serde_json::from_str(&text)
        .with_context(|| format!("parsing pipeline description {}", stages_path.display()))?;

    let dag = StageDag::from_spec(spec, opts.default_job_mem)?;
    info!(
        pipeline = %opts.pipeline_name,
        total_stages = dag.total(),
        "pipeline constructed"
    );

    let pipeline = Arc::new(Pipeline::new(dag, opts)?);
    info!(
        already_finished = pipeline.restored_count().await,
        "starting server"
    );

    let outcome = server::run_server(pipeline).await?;
    Ok(if outcome.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
