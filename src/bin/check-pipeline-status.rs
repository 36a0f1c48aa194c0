//! Query a running pipeline server for its progress counts.
//!
//! Usage:
//!   check-pipeline-status --uri-file /scratch/run1/pipeline_uri

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tonic::transport::Endpoint;

use pydpiper::config;
use pydpiper::proto::{self, executor_bridge_client::ExecutorBridgeClient};

#[derive(Parser, Debug)]
#[command(
    name = "check-pipeline-status",
    about = "Query a running pipeline server"
)]
struct Args {
    /// File containing the server address, as written by the server.
    #[arg(long, env = "PYDPIPER_URIFILE")]
    uri_file: Option<PathBuf>,

    /// Server address, overriding the uri file.
    #[arg(long, env = "PYDPIPER_SERVER_ADDR")]
    server_addr: Option<String>,

    #[arg(long, env = "PYDPIPER_PIPELINE_NAME", default_value = "pipeline")]
    pipeline_name: String,

    #[arg(long, env = "PYDPIPER_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_site_defaults();
    let args = Args::parse();

    let url = match &args.server_addr {
        Some(addr) if addr.starts_with("http") => addr.clone(),
        Some(addr) => format!("http://{addr}"),
        None => {
            let path = args.uri_file.clone().unwrap_or_else(|| {
                args.output_dir.join(format!("{}_uri", args.pipeline_name))
            });
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading uri file {}", path.display()))?;
            text.trim().to_string()
        }
    };

    let channel = Endpoint::from_shared(url.clone())
        .context("invalid server url")?
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(10))
        .connect()
        .await
        .with_context(|| format!("connecting to pipeline server at {url}"))?;
    let mut client = ExecutorBridgeClient::new(channel);

    let status = client
        .query_status(proto::StatusRequest {})
        .await
        .context("querying pipeline status")?
        .into_inner();

    println!(
        "{} of {} stages complete ({} failed, {} running, {} runnable)",
        status.finished, status.total, status.failed, status.running, status.runnable
    );
    if !status.failed_stage_ids.is_empty() {
        let ids: Vec<String> = status
            .failed_stage_ids
            .iter()
            .map(|id| id.to_string())
            .collect();
        println!("failed stages: {}", ids.join(", "));
    }
    Ok(())
}
