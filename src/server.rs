//! ExecutorBridge gRPC service and the server run loop.
//!
//! All executor traffic multiplexes over a single tonic acceptor on one
//! listener; handlers dispatch into the `Pipeline` critical section. A
//! supervisor loop ticks every few seconds for executor reaping,
//! autoscaling and the status line, and drives the drain at the end.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ServerOptions;
use crate::messages::{proto, run_stage_response, shutdown_response, wait_response};
use crate::pipeline::{Pipeline, PipelineError, PipelineOutcome, WorkReply, LOOP_INTERVAL};
use crate::submit;

/// How long to wait for idle executors to notice the drain and unregister.
/// The deadline slides while stages are still running so in-flight work is
/// never cut off.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

pub struct ExecutorBridgeService {
    pipeline: Arc<Pipeline>,
}

impl ExecutorBridgeService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        ExecutorBridgeService { pipeline }
    }
}

fn parse_executor_id(s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s).map_err(|_| Status::invalid_argument("malformed executor id"))
}

fn to_status(err: PipelineError) -> Status {
    match err {
        PipelineError::UnknownExecutor(_) => Status::not_found(err.to_string()),
        PipelineError::StageNotRunning { .. } => Status::failed_precondition(err.to_string()),
        PipelineError::LogWrite(_) => Status::internal(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl proto::executor_bridge_server::ExecutorBridge for ExecutorBridgeService {
    async fn register_executor(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .pipeline
            .register_executor(req.total_memory_gb, req.cores)
            .await;
        Ok(Response::new(proto::RegisterResponse {
            executor_id: id.to_string(),
        }))
    }

    async fn request_work(
        &self,
        request: Request<proto::WorkRequest>,
    ) -> Result<Response<proto::WorkResponse>, Status> {
        let req = request.into_inner();
        let id = parse_executor_id(&req.executor_id)?;
        let reply = self
            .pipeline
            .request_work(id, req.free_memory_gb, req.free_cores)
            .await
            .map_err(to_status)?;
        let resp = match reply {
            WorkReply::Run(d) => run_stage_response(proto::StageAssignment {
                stage_id: d.stage_id,
                command: d.command,
                log_file: d.log_file.display().to_string(),
                memory_gb: d.memory_gb,
                cores: d.cores,
            }),
            WorkReply::Wait => wait_response(),
            WorkReply::Shutdown => shutdown_response(),
        };
        Ok(Response::new(resp))
    }

    async fn report_finished(
        &self,
        request: Request<proto::FinishedReport>,
    ) -> Result<Response<proto::ReportAck>, Status> {
        let req = request.into_inner();
        let id = parse_executor_id(&req.executor_id)?;
        self.pipeline
            .report_finished(id, req.stage_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::ReportAck {}))
    }

    async fn report_failed(
        &self,
        request: Request<proto::FailedReport>,
    ) -> Result<Response<proto::ReportAck>, Status> {
        let req = request.into_inner();
        let id = parse_executor_id(&req.executor_id)?;
        self.pipeline
            .report_failed(id, req.stage_id, &req.reason)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::ReportAck {}))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatPing>,
    ) -> Result<Response<proto::HeartbeatAck>, Status> {
        let req = request.into_inner();
        let id = parse_executor_id(&req.executor_id)?;
        self.pipeline
            .heartbeat(id, req.tick, req.resident_memory_gb)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::HeartbeatAck {}))
    }

    async fn unregister_executor(
        &self,
        request: Request<proto::UnregisterRequest>,
    ) -> Result<Response<proto::UnregisterAck>, Status> {
        let req = request.into_inner();
        let id = parse_executor_id(&req.executor_id)?;
        self.pipeline
            .unregister_executor(id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::UnregisterAck {}))
    }

    async fn query_status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let status = self.pipeline.query_status().await;
        Ok(Response::new(proto::StatusResponse {
            total: status.total as u64,
            finished: status.finished as u64,
            failed: status.failed as u64,
            running: status.running as u64,
            runnable: status.runnable as u64,
            failed_stage_ids: status.failed_ids,
        }))
    }
}

/// Serve the bridge, supervise the pipeline to completion, drain the
/// executors, and return the final outcome.
pub async fn run_server(pipeline: Arc<Pipeline>) -> Result<PipelineOutcome> {
    let opts = pipeline.options().clone();

    let listener = TcpListener::bind(&opts.server_addr)
        .await
        .with_context(|| format!("binding {}", opts.server_addr))?;
    let local_addr = listener.local_addr()?;

    let uri_file = opts.uri_file();
    if let Some(parent) = uri_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&uri_file, format!("http://{local_addr}\n"))
        .with_context(|| format!("writing uri file {}", uri_file.display()))?;
    info!(addr = %local_addr, uri_file = %uri_file.display(), "pipeline server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let service = ExecutorBridgeService::new(Arc::clone(&pipeline));
    let server_task = tokio::spawn(
        Server::builder()
            .add_service(proto::executor_bridge_server::ExecutorBridgeServer::new(
                service,
            ))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = shutdown_rx.await;
            }),
    );

    supervise_until_drained(&pipeline, &opts, &uri_file).await;

    let _ = shutdown_tx.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "bridge server error"),
        Err(err) => error!(error = %err, "bridge server task panicked"),
    }

    let outcome = pipeline.outcome().await;
    report_outcome(&outcome);
    Ok(outcome)
}

/// The supervisor loop: reap, autoscale, print progress; on shutdown, keep
/// ticking (so reaping continues) until every executor has unregistered or
/// the sliding grace period expires.
async fn supervise_until_drained(pipeline: &Pipeline, opts: &ServerOptions, uri_file: &Path) {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut last_status = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(LOOP_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received; draining executors");
                pipeline.initiate_shutdown().await;
            }
            _ = recv_terminate(&mut sigterm) => {
                warn!("SIGTERM received; draining executors");
                pipeline.initiate_shutdown().await;
            }
        }

        let verdict = pipeline.supervise().await;
        let s = &verdict.status;
        let key = (s.finished, s.failed, s.running);
        if last_status != Some(key) {
            info!(
                "{} of {} stages complete ({} failed, {} running)",
                s.finished, s.total, s.failed, s.running
            );
            last_status = Some(key);
        }

        if verdict.shutdown {
            if verdict.active_executors == 0 {
                break;
            }
            let now = Instant::now();
            if s.running > 0 {
                // In-flight work: let it finish, keep the deadline fresh.
                drain_deadline = Some(now + DRAIN_GRACE);
            }
            match drain_deadline {
                Some(deadline) if now >= deadline => {
                    warn!(
                        remaining = verdict.active_executors,
                        "drain grace expired with executors still registered; exiting"
                    );
                    break;
                }
                None => drain_deadline = Some(now + DRAIN_GRACE),
                _ => {}
            }
            continue;
        }

        if verdict.executors_to_launch > 0 {
            let launched = submit::launch_executors(
                opts,
                uri_file,
                verdict.executors_to_launch,
                verdict.memory_request_gb,
            )
            .await;
            pipeline.note_launched(launched).await;
        }
    }
}

async fn recv_terminate(sigterm: &mut Option<tokio::signal::unix::Signal>) {
    match sigterm {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn report_outcome(outcome: &PipelineOutcome) {
    if let Some(fatal) = &outcome.fatal {
        error!("pipeline failed: {fatal}");
    }
    if outcome.success() {
        info!(
            "all {} pipeline stages have been processed; pipeline finished successfully",
            outcome.total
        );
    } else {
        warn!(
            "{} of {} stages complete; {} failed",
            outcome.finished,
            outcome.total,
            outcome.failed.len()
        );
        for f in &outcome.failed {
            warn!(
                stage = f.id,
                log_file = %f.log_file.display(),
                "failed: {}",
                f.command
            );
        }
    }
}
