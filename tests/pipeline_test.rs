//! End-to-end pipeline scenarios over real gRPC and real child processes.
//!
//! Each test builds a small DAG of `/bin/sh` stages, serves the executor
//! bridge on an ephemeral port, and drives a real executor agent against
//! it. Assertions cover execution order, the on-disk completion log, retry
//! accounting and idempotent restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser as _;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use pydpiper::completion_log;
use pydpiper::config::{ExecutorOptions, ServerOptions};
use pydpiper::proto::executor_bridge_server::ExecutorBridgeServer;
use pydpiper::stage::{PipelineSpec, StageSpec, StageStatus};
use pydpiper::{executor, ExecutorBridgeService, Pipeline, StageDag};

struct TestBridge {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl TestBridge {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

async fn start_bridge(pipeline: Arc<Pipeline>) -> TestBridge {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel::<()>();
    let service = ExecutorBridgeService::new(pipeline);
    let handle = tokio::spawn(
        Server::builder()
            .add_service(ExecutorBridgeServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = rx.await;
            }),
    );
    TestBridge {
        url: format!("http://{addr}"),
        shutdown: Some(tx),
        handle,
    }
}

fn server_options(dir: &Path) -> ServerOptions {
    ServerOptions::parse_from([
        "pipeline-server",
        "--output-dir",
        &dir.display().to_string(),
    ])
}

fn executor_options(url: &str, dir: &Path) -> ExecutorOptions {
    ExecutorOptions::parse_from([
        "pipeline-executor",
        "--server-addr",
        url,
        "--output-dir",
        &dir.display().to_string(),
        "--mem",
        "4",
        "--proc",
        "2",
        "--idle-timeout",
        "30",
        "--heartbeat-interval",
        "1",
    ])
}

fn sh(script: &str) -> StageSpec {
    StageSpec {
        cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        inputs: vec![],
        outputs: vec![],
        mem: None,
        procs: 1,
        log_file: None,
        on_runnable: vec![],
        on_finished: vec![],
    }
}

fn build_pipeline(
    dir: &Path,
    stages: Vec<StageSpec>,
    edges: Vec<[u32; 2]>,
) -> Arc<Pipeline> {
    let opts = server_options(dir);
    let dag = StageDag::from_spec(PipelineSpec { stages, edges }, opts.default_job_mem)
        .expect("valid spec");
    Arc::new(Pipeline::new(dag, opts).expect("pipeline builds"))
}

fn log_lines(dir: &Path) -> Vec<String> {
    let path = completion_log::default_path(dir, "pipeline");
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}

#[tokio::test]
async fn linear_chain_executes_in_order() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace.txt");
    let mark = |tag: &str| sh(&format!("echo {tag} >> {}", trace.display()));

    let pipeline = build_pipeline(
        dir.path(),
        vec![mark("a"), mark("b"), mark("c")],
        vec![[0, 1], [1, 2]],
    );
    let mut fps = Vec::new();
    for id in 0..3 {
        fps.push(pipeline.stage_fingerprint(id).await.to_string());
    }

    let bridge = start_bridge(Arc::clone(&pipeline)).await;
    let summary = executor::run_executor(executor_options(&bridge.url, dir.path()))
        .await
        .expect("executor runs");
    bridge.stop().await;

    assert_eq!(summary.ran, 3);
    assert_eq!(summary.failed, 0);

    // Stages ran in dependency order.
    let trace_text = std::fs::read_to_string(&trace).unwrap();
    assert_eq!(trace_text, "a\nb\nc\n");

    // The completion log records the fingerprints in completion order.
    assert_eq!(log_lines(dir.path()), fps);

    // Per-stage logs carry the execution header.
    let stage_log: PathBuf = dir.path().join("pipeline_logs").join("sh-0.log");
    let text = std::fs::read_to_string(&stage_log).expect("stage log written");
    assert!(text.starts_with("Running on: "));

    assert!(pipeline.outcome().await.success());
}

#[tokio::test]
async fn transient_failure_retries_until_success() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("attempt1");
    let second = dir.path().join("attempt2");
    // Fails on the first two attempts, succeeds on the third.
    let flaky = sh(&format!(
        "if [ -f {s} ]; then exit 0; elif [ -f {f} ]; then : > {s}; exit 1; else : > {f}; exit 1; fi",
        f = first.display(),
        s = second.display(),
    ));
    let dependent = sh("true");

    let pipeline = build_pipeline(dir.path(), vec![flaky, dependent], vec![[0, 1]]);
    let flaky_fp = pipeline.stage_fingerprint(0).await.to_string();

    let bridge = start_bridge(Arc::clone(&pipeline)).await;
    let summary = executor::run_executor(executor_options(&bridge.url, dir.path()))
        .await
        .expect("executor runs");
    bridge.stop().await;

    assert_eq!(summary.ran, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(pipeline.stage_state(0).await, (StageStatus::Finished, 2));
    assert!(log_lines(dir.path()).contains(&flaky_fp));
    assert!(pipeline.outcome().await.success());
}

#[tokio::test]
async fn permanent_failure_spares_siblings() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace.txt");

    // a -> {b, c}: b always fails, c succeeds.
    let pipeline = build_pipeline(
        dir.path(),
        vec![
            sh(&format!("echo a >> {}", trace.display())),
            sh("exit 1"),
            sh(&format!("echo c >> {}", trace.display())),
        ],
        vec![[0, 1], [0, 2]],
    );

    let bridge = start_bridge(Arc::clone(&pipeline)).await;
    let summary = executor::run_executor(executor_options(&bridge.url, dir.path()))
        .await
        .expect("executor runs");
    bridge.stop().await;

    assert_eq!(summary.ran, 2);
    assert_eq!(summary.failed, 3);

    assert_eq!(pipeline.stage_state(0).await.0, StageStatus::Finished);
    assert_eq!(pipeline.stage_state(1).await, (StageStatus::Failed, 2));
    assert_eq!(pipeline.stage_state(2).await.0, StageStatus::Finished);

    let outcome = pipeline.outcome().await;
    assert!(!outcome.success());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].id, 1);

    let status = pipeline.query_status().await;
    assert_eq!(status.finished, 2);
    assert_eq!(status.failed_ids, vec![1]);
}

#[tokio::test]
async fn restart_executes_nothing_when_everything_finished() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace.txt");
    let stages = || {
        vec![
            sh(&format!("echo s0 >> {}", trace.display())),
            sh(&format!("echo s1 >> {}", trace.display())),
            sh(&format!("echo s2 >> {}", trace.display())),
            sh(&format!("echo s3 >> {}", trace.display())),
        ]
    };
    let edges = vec![[0, 2], [1, 2], [2, 3]];

    // First run to completion.
    {
        let pipeline = build_pipeline(dir.path(), stages(), edges.clone());
        let bridge = start_bridge(Arc::clone(&pipeline)).await;
        let summary = executor::run_executor(executor_options(&bridge.url, dir.path()))
            .await
            .expect("executor runs");
        bridge.stop().await;
        assert_eq!(summary.ran, 4);
        assert!(pipeline.outcome().await.success());
    }

    // Relaunch against the same working directory and identical DAG: every
    // stage is recognized from the log and nothing executes.
    let pipeline = build_pipeline(dir.path(), stages(), edges);
    assert_eq!(pipeline.restored_count().await, 4);

    let bridge = start_bridge(Arc::clone(&pipeline)).await;
    let summary = executor::run_executor(executor_options(&bridge.url, dir.path()))
        .await
        .expect("executor runs");
    bridge.stop().await;

    assert_eq!(summary.ran, 0);
    assert_eq!(summary.failed, 0);

    // Each marker was written exactly once across both runs.
    let trace_text = std::fs::read_to_string(&trace).unwrap();
    assert_eq!(trace_text.lines().count(), 4);

    let outcome = pipeline.outcome().await;
    assert!(outcome.success());
    assert_eq!(outcome.finished, outcome.total);
}
