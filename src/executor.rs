//! The executor agent.
//!
//! A thin worker that registers with the pipeline server, heartbeats, and
//! loops over {request work; spawn the command; report the outcome}. It
//! runs up to its core count of stages concurrently, summing their memory
//! assignments against its declared total; `--greedy` runs one stage at a
//! time with the full allotment. Child stdout/stderr go to the per-stage
//! log file. The executor shuts itself down when the server is repeatedly
//! unreachable, when it has been idle too long, or when its walltime
//! budget is nearly exhausted; SIGINT kills tracked children before exit.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

use crate::config::ExecutorOptions;
use crate::messages::proto::{self, executor_bridge_client::ExecutorBridgeClient, WorkDirective};

/// Every call to the server carries this timeout.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// How long initial registration is retried before giving up.
const REGISTRATION_WINDOW: Duration = Duration::from_secs(180);
const REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Poll cadence when the server has no work for us.
const WORK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REPORT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const REPORT_ATTEMPTS: u32 = 3;
/// Consecutive transport failures before the executor gives up on the
/// server and drains (idling indefinitely helps nobody).
const MAX_TRANSPORT_FAILURES: u32 = 3;
/// Stop accepting work when the remaining walltime falls below this.
const LIFETIME_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub struct ExecutorSummary {
    pub ran: usize,
    pub failed: usize,
}

struct StageOutcome {
    stage_id: u32,
    memory_gb: f64,
    cores: u32,
    result: std::io::Result<ExitStatus>,
}

/// Find the server address: `--server-addr` wins, otherwise poll the uri
/// file the server writes at startup (it may not exist yet when both jobs
/// start together on a batch substrate).
pub async fn resolve_server_url(opts: &ExecutorOptions) -> Result<String> {
    if let Some(addr) = &opts.server_addr {
        return Ok(normalize_url(addr));
    }
    let path = opts
        .uri_file
        .clone()
        .unwrap_or_else(|| opts.output_dir.join(format!("{}_uri", opts.pipeline_name)));
    let deadline = Instant::now() + REGISTRATION_WINDOW;
    loop {
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => return Ok(normalize_url(text.trim())),
            _ if Instant::now() >= deadline => {
                anyhow::bail!("server uri file {} did not appear", path.display())
            }
            _ => sleep(Duration::from_secs(2)).await,
        }
    }
}

fn normalize_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn connect_with_retry(url: &str) -> Result<ExecutorBridgeClient<Channel>> {
    let deadline = Instant::now() + REGISTRATION_WINDOW;
    loop {
        let endpoint = Endpoint::from_shared(url.to_string())
            .context("invalid server url")?
            .connect_timeout(RPC_TIMEOUT)
            .timeout(RPC_TIMEOUT);
        match endpoint.connect().await {
            Ok(channel) => return Ok(ExecutorBridgeClient::new(channel)),
            Err(err) if Instant::now() < deadline => {
                debug!(error = %err, "server not accepting yet; retrying registration");
                sleep(REGISTRATION_RETRY_INTERVAL).await;
            }
            Err(err) => {
                return Err(anyhow!(err).context(format!(
                    "could not reach pipeline server at {url} within the registration window"
                )))
            }
        }
    }
}

/// Run one executor to completion. Returns how many stages it ran.
pub async fn run_executor(opts: ExecutorOptions) -> Result<ExecutorSummary> {
    if opts.start_delay > 0 {
        info!(
            delay_secs = opts.start_delay,
            "waiting for the server to come up before first contact"
        );
        sleep(Duration::from_secs(opts.start_delay)).await;
    }

    let url = resolve_server_url(&opts).await?;
    let mut client = connect_with_retry(&url).await?;

    let cores = opts.procs.max(1);
    let response = client
        .register_executor(proto::RegisterRequest {
            total_memory_gb: opts.mem,
            cores,
        })
        .await
        .context("registering with the pipeline server")?;
    let executor_id = response.into_inner().executor_id;
    info!(
        executor = %executor_id,
        server = %url,
        mem_gb = opts.mem,
        cores,
        greedy = opts.greedy,
        "registered with pipeline server"
    );

    let unreachable = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    let (kill_tx, _) = watch::channel(false);

    // SIGINT kills tracked children before exit.
    {
        let interrupted = Arc::clone(&interrupted);
        let kill = kill_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; killing child processes");
                interrupted.store(true, Ordering::SeqCst);
                let _ = kill.send(true);
            }
        });
    }

    let heartbeat_task = spawn_heartbeat(
        client.clone(),
        executor_id.clone(),
        Duration::from_secs(opts.heartbeat_interval.max(1)),
        Arc::clone(&unreachable),
    );

    let (done_tx, done_rx) = mpsc::channel(64);
    let mut worker = Worker {
        client: client.clone(),
        executor_id: executor_id.clone(),
        total_mem_gb: opts.mem,
        cores,
        greedy: opts.greedy,
        idle_timeout: Duration::from_secs(opts.idle_timeout.max(1)),
        lifetime: opts.lifetime.map(Duration::from_secs),
        unreachable,
        interrupted,
        kill_tx,
        done_tx,
        done_rx,
        running: HashMap::new(),
        reserved_mem_gb: 0.0,
        reserved_cores: 0,
        transport_failures: 0,
        summary: ExecutorSummary::default(),
    };
    let summary = worker.run().await;

    // Best-effort clean unregistration; the server reaps us via heartbeat
    // loss if this never arrives.
    let _ = client
        .unregister_executor(proto::UnregisterRequest {
            executor_id: executor_id.clone(),
        })
        .await;
    heartbeat_task.abort();
    info!(
        ran = summary.ran,
        failed = summary.failed,
        "executor shutting down"
    );
    Ok(summary)
}

fn spawn_heartbeat(
    mut client: ExecutorBridgeClient<Channel>,
    executor_id: String,
    interval: Duration,
    unreachable: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = 0u64;
        let mut failures = 0u32;
        loop {
            sleep(interval).await;
            if unreachable.load(Ordering::SeqCst) {
                break;
            }
            tick += 1;
            let ping = proto::HeartbeatPing {
                executor_id: executor_id.clone(),
                tick,
                resident_memory_gb: resident_memory_gb().unwrap_or(0.0),
            };
            match client.heartbeat(ping).await {
                Ok(_) => failures = 0,
                Err(status) => {
                    failures += 1;
                    warn!(
                        error = %status,
                        failures,
                        "heartbeat failed"
                    );
                    if failures >= MAX_TRANSPORT_FAILURES {
                        warn!("server unreachable; executor will shut down");
                        unreachable.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    })
}

struct Worker {
    client: ExecutorBridgeClient<Channel>,
    executor_id: String,
    total_mem_gb: f64,
    cores: u32,
    greedy: bool,
    idle_timeout: Duration,
    lifetime: Option<Duration>,
    unreachable: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
    kill_tx: watch::Sender<bool>,
    done_tx: mpsc::Sender<StageOutcome>,
    done_rx: mpsc::Receiver<StageOutcome>,
    /// stage id -> (reserved memory, reserved cores)
    running: HashMap<u32, (f64, u32)>,
    reserved_mem_gb: f64,
    reserved_cores: u32,
    transport_failures: u32,
    summary: ExecutorSummary,
}

impl Worker {
    async fn run(&mut self) -> ExecutorSummary {
        let started = Instant::now();
        let mut last_work = Instant::now();
        let mut draining = false;

        loop {
            while let Ok(outcome) = self.done_rx.try_recv() {
                self.handle_outcome(outcome).await;
            }

            if self.interrupted.load(Ordering::SeqCst) || self.unreachable.load(Ordering::SeqCst) {
                self.abort_children().await;
                break;
            }
            if draining && self.running.is_empty() {
                break;
            }

            if let Some(limit) = self.lifetime {
                if !draining && started.elapsed() + LIFETIME_MARGIN >= limit {
                    info!("walltime nearly exhausted; draining");
                    draining = true;
                }
            }

            let slots_free = self.running.len() < self.concurrency();
            if !draining && slots_free {
                match self.request_work().await {
                    Some(WorkDirective::RunStage) => {
                        last_work = Instant::now();
                        continue;
                    }
                    Some(WorkDirective::Shutdown) => {
                        info!("server requested shutdown; draining");
                        draining = true;
                        continue;
                    }
                    _ => {
                        if self.running.is_empty() && last_work.elapsed() > self.idle_timeout {
                            info!(
                                idle_secs = last_work.elapsed().as_secs(),
                                "no work within the idle timeout; draining"
                            );
                            draining = true;
                            continue;
                        }
                    }
                }
            }

            self.wait_for_event().await;
        }

        std::mem::take(&mut self.summary)
    }

    fn concurrency(&self) -> usize {
        if self.greedy {
            1
        } else {
            self.cores as usize
        }
    }

    /// Resources offered with a work request. Greedy executors always
    /// offer their whole allotment.
    fn free_resources(&self) -> (f64, u32) {
        if self.greedy {
            (self.total_mem_gb, self.cores)
        } else {
            (
                (self.total_mem_gb - self.reserved_mem_gb).max(0.0),
                self.cores.saturating_sub(self.reserved_cores),
            )
        }
    }

    /// Ask the server for a stage; spawn it if one is assigned. Returns
    /// the directive for the main loop.
    async fn request_work(&mut self) -> Option<WorkDirective> {
        let (free_mem, free_cores) = self.free_resources();
        let request = proto::WorkRequest {
            executor_id: self.executor_id.clone(),
            free_memory_gb: free_mem,
            free_cores,
        };
        match self.client.request_work(request).await {
            Ok(response) => {
                self.transport_failures = 0;
                let response = response.into_inner();
                let directive = response.directive();
                if directive == WorkDirective::RunStage {
                    if let Some(assignment) = response.stage {
                        self.start_stage(assignment);
                    }
                }
                Some(directive)
            }
            Err(status) => {
                self.transport_failures += 1;
                warn!(error = %status, failures = self.transport_failures, "work request failed");
                if self.transport_failures >= MAX_TRANSPORT_FAILURES {
                    self.unreachable.store(true, Ordering::SeqCst);
                }
                None
            }
        }
    }

    fn start_stage(&mut self, assignment: proto::StageAssignment) {
        self.reserved_mem_gb += assignment.memory_gb;
        self.reserved_cores += assignment.cores;
        self.running
            .insert(assignment.stage_id, (assignment.memory_gb, assignment.cores));
        info!(
            stage = assignment.stage_id,
            mem_gb = format_args!("{:.2}", assignment.memory_gb),
            "starting stage: {}",
            assignment.command.join(" ")
        );
        let done = self.done_tx.clone();
        let kill = self.kill_tx.subscribe();
        tokio::spawn(async move {
            let result = run_stage_command(&assignment, kill).await;
            let _ = done
                .send(StageOutcome {
                    stage_id: assignment.stage_id,
                    memory_gb: assignment.memory_gb,
                    cores: assignment.cores,
                    result,
                })
                .await;
        });
    }

    async fn handle_outcome(&mut self, outcome: StageOutcome) {
        self.running.remove(&outcome.stage_id);
        self.reserved_mem_gb = (self.reserved_mem_gb - outcome.memory_gb).max(0.0);
        self.reserved_cores = self.reserved_cores.saturating_sub(outcome.cores);

        match outcome.result {
            Ok(status) if status.success() => {
                self.summary.ran += 1;
                info!(stage = outcome.stage_id, "stage succeeded");
                self.report(outcome.stage_id, None).await;
            }
            Ok(status) => {
                self.summary.failed += 1;
                let reason = describe_exit(status);
                warn!(stage = outcome.stage_id, reason = %reason, "stage failed");
                self.report(outcome.stage_id, Some(reason)).await;
            }
            Err(err) => {
                self.summary.failed += 1;
                let reason = format!("failed to spawn: {err}");
                warn!(stage = outcome.stage_id, reason = %reason, "stage failed");
                self.report(outcome.stage_id, Some(reason)).await;
            }
        }
    }

    /// Deliver an outcome report, retrying transient server errors (a
    /// rejected completion-log write surfaces here as `internal`). Reports
    /// the server no longer wants, because the stage was requeued after we
    /// were presumed lost, are dropped.
    async fn report(&mut self, stage_id: u32, failure: Option<String>) {
        if self.unreachable.load(Ordering::SeqCst) {
            debug!(stage = stage_id, "server unreachable; not reporting");
            return;
        }
        for attempt in 1..=REPORT_ATTEMPTS {
            let result = match &failure {
                None => self
                    .client
                    .report_finished(proto::FinishedReport {
                        executor_id: self.executor_id.clone(),
                        stage_id,
                    })
                    .await
                    .map(|_| ()),
                Some(reason) => self
                    .client
                    .report_failed(proto::FailedReport {
                        executor_id: self.executor_id.clone(),
                        stage_id,
                        reason: reason.clone(),
                    })
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => return,
                Err(status)
                    if matches!(status.code(), Code::NotFound | Code::FailedPrecondition) =>
                {
                    warn!(
                        stage = stage_id,
                        error = %status,
                        "server no longer tracks this stage on us; dropping report"
                    );
                    return;
                }
                Err(status) => {
                    warn!(
                        stage = stage_id,
                        attempt,
                        error = %status,
                        "outcome report failed"
                    );
                    if attempt == REPORT_ATTEMPTS {
                        self.unreachable.store(true, Ordering::SeqCst);
                    } else {
                        sleep(REPORT_RETRY_INTERVAL).await;
                    }
                }
            }
        }
    }

    /// Block until a child finishes or the poll interval elapses.
    async fn wait_for_event(&mut self) {
        tokio::select! {
            outcome = self.done_rx.recv() => {
                if let Some(outcome) = outcome {
                    self.handle_outcome(outcome).await;
                }
            }
            _ = sleep(WORK_POLL_INTERVAL) => {}
        }
    }

    /// Kill every child and collect their outcomes. Failed reports are
    /// still attempted so the server can requeue promptly rather than
    /// waiting out the latency tolerance.
    async fn abort_children(&mut self) {
        if self.running.is_empty() {
            return;
        }
        warn!(count = self.running.len(), "killing in-flight stage processes");
        let _ = self.kill_tx.send(true);
        while !self.running.is_empty() {
            match self.done_rx.recv().await {
                Some(outcome) => self.handle_outcome(outcome).await,
                None => break,
            }
        }
    }
}

/// Spawn the stage command with stdout/stderr appended to its log file and
/// wait for it, honoring the kill signal.
async fn run_stage_command(
    assignment: &proto::StageAssignment,
    mut kill: watch::Receiver<bool>,
) -> std::io::Result<ExitStatus> {
    let log_path = PathBuf::from(&assignment.log_file);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    writeln!(
        log,
        "Running on: {} at {}",
        hostname(),
        chrono::Local::now().to_rfc3339()
    )?;
    writeln!(log, "{}", assignment.command.join(" "))?;
    log.flush()?;

    let program = assignment.command.first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty stage command")
    })?;
    let stdout = log.try_clone()?;
    let mut child = Command::new(program)
        .args(&assignment.command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(log))
        .spawn()?;
    debug!(
        stage = assignment.stage_id,
        pid = child.id(),
        "spawned stage process"
    );

    tokio::select! {
        status = child.wait() => status,
        _ = killed(&mut kill) => {
            warn!(stage = assignment.stage_id, pid = child.id(), "killing stage process");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

async fn killed(kill: &mut watch::Receiver<bool>) {
    loop {
        if *kill.borrow() {
            return;
        }
        if kill.changed().await.is_err() {
            // Sender gone without a kill: never fires.
            std::future::pending::<()>().await;
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("terminated by signal {signal}");
                }
            }
            "terminated abnormally".to_string()
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Resident set size of this process, for heartbeat bookkeeping.
#[cfg(target_os = "linux")]
fn resident_memory_gb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096.0 / (1024.0 * 1024.0 * 1024.0))
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_gb() -> Option<f64> {
    None
}
