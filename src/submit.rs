//! Launching executors on the local host or a batch substrate.
//!
//! The server autoscale loop calls [`launch_executors`] with a count and a
//! memory request sized to the largest runnable stage. Locally that spawns
//! `pipeline-executor` children directly; on SGE/OGS and PBS/Torque it
//! submits qsub jobs whose resource request is expressed through the
//! configurable memory variable (`mem` by default, `vmem` on some sites)
//! and, on SGE, the configured parallel environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{QueueType, ServerOptions};

/// The executor binary, expected next to the server binary or on PATH.
fn executor_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("pipeline-executor");
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from("pipeline-executor")
}

/// Arguments handed to every launched executor.
fn executor_arguments(
    opts: &ServerOptions,
    uri_file: &Path,
    mem_gb: f64,
    start_delay_secs: u64,
) -> Vec<String> {
    let mut args = vec![
        "--uri-file".to_string(),
        uri_file.display().to_string(),
        "--pipeline-name".to_string(),
        opts.pipeline_name.clone(),
        "--output-dir".to_string(),
        opts.output_dir.display().to_string(),
        "--mem".to_string(),
        format!("{mem_gb:.2}"),
        "--proc".to_string(),
        opts.procs.to_string(),
        "--start-delay".to_string(),
        start_delay_secs.to_string(),
    ];
    if opts.greedy {
        args.push("--greedy".to_string());
    }
    args
}

/// qsub arguments for one executor job on the given substrate.
fn qsub_arguments(opts: &ServerOptions, mem_gb: f64) -> Vec<String> {
    let job_name = format!("{}-executor", opts.pipeline_name);
    match opts.queue_type {
        QueueType::Sge => {
            let mut args = vec![
                "-cwd".to_string(),
                "-j".to_string(),
                "y".to_string(),
                "-V".to_string(),
                "-N".to_string(),
                job_name,
                "-l".to_string(),
                format!("{}={}G", opts.mem_request_variable, mem_gb.ceil() as u64),
            ];
            if let Some(pe) = &opts.pe {
                args.push("-pe".to_string());
                args.push(pe.clone());
                args.push(opts.procs.to_string());
            }
            args
        }
        QueueType::Pbs => vec![
            "-j".to_string(),
            "oe".to_string(),
            "-V".to_string(),
            "-N".to_string(),
            job_name,
            "-l".to_string(),
            format!("{}={}gb", opts.mem_request_variable, mem_gb.ceil() as u64),
            "-l".to_string(),
            format!("nodes=1:ppn={}", opts.procs),
        ],
        QueueType::Local => Vec::new(),
    }
}

/// Launch `count` executors sized to `mem_gb`. Returns how many were
/// actually submitted; failures are logged and skipped so a broken qsub
/// does not wedge the supervisor loop.
pub async fn launch_executors(
    opts: &ServerOptions,
    uri_file: &Path,
    count: usize,
    mem_gb: f64,
) -> usize {
    let mut launched = 0;
    for _ in 0..count {
        let result = match opts.queue_type {
            QueueType::Local => spawn_local(opts, uri_file, mem_gb).await,
            QueueType::Sge | QueueType::Pbs => submit_to_queue(opts, uri_file, mem_gb).await,
        };
        match result {
            Ok(()) => launched += 1,
            Err(err) => warn!(error = %err, "failed to launch executor"),
        }
    }
    if launched > 0 {
        info!(
            launched,
            mem_gb = format_args!("{mem_gb:.2}"),
            queue = ?opts.queue_type,
            "launched executors"
        );
    }
    launched
}

/// Local substrate: executors are plain child processes writing their own
/// log files. They start immediately, so no startup stagger is needed.
async fn spawn_local(opts: &ServerOptions, uri_file: &Path, mem_gb: f64) -> Result<()> {
    let log_dir = opts
        .output_dir
        .join(format!("{}_executor_logs", opts.pipeline_name));
    std::fs::create_dir_all(&log_dir).context("creating executor log directory")?;
    let log_path = log_dir.join(format!("executor-{}.log", uuid::Uuid::new_v4()));
    let log = std::fs::File::create(&log_path)
        .with_context(|| format!("creating executor log {}", log_path.display()))?;
    let stderr = log.try_clone().context("cloning executor log handle")?;

    let mut command = Command::new(executor_binary());
    command
        .args(executor_arguments(opts, uri_file, mem_gb, 0))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));
    let child = command.spawn().context("spawning local pipeline-executor")?;
    info!(pid = child.id(), log = %log_path.display(), "spawned local executor");
    Ok(())
}

/// Batch substrate: write the executor invocation as a job script on
/// qsub's stdin. The job may sit in the queue while the server is still
/// starting, so the advertised start delay is passed through.
async fn submit_to_queue(opts: &ServerOptions, uri_file: &Path, mem_gb: f64) -> Result<()> {
    let start_delay = opts.executor_start_delay().as_secs();
    let script = format!(
        "#!/bin/sh\nexec {} {}\n",
        executor_binary().display(),
        executor_arguments(opts, uri_file, mem_gb, start_delay).join(" ")
    );

    let mut command = Command::new("qsub");
    command
        .args(qsub_arguments(opts, mem_gb))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    let mut child = command.spawn().context("spawning qsub")?;
    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(script.as_bytes())
        .await
        .context("writing qsub job script")?;
    let status = child.wait().await.context("waiting for qsub")?;
    if !status.success() {
        anyhow::bail!("qsub exited with {status}");
    }
    Ok(())
}
