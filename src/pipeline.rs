//! Pipeline coordinator: the scheduler core.
//!
//! One `Pipeline` per invocation owns the stage DAG, the completion log and
//! the executor table. The server is logically single-threaded over this
//! state: every mutation happens under one mutex, and RPC handlers dispatch
//! into it. Heartbeats take the lock for a strictly shorter section than
//! dispatch so that completion-log fsyncs cannot starve liveness tracking.
//!
//! The key ordering rule is write-ahead: a finished stage's fingerprint is
//! durable in the completion log before any dependent becomes runnable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::completion_log::{self, CompletionLog};
use crate::config::ServerOptions;
use crate::dag::{DagError, StageDag};
use crate::fingerprint::Fingerprint;
use crate::stage::{
    CompletionAction, RunnableAction, Stage, StageId, StageStatus, MAX_STAGE_RETRIES,
};

/// Supervisor cadence: executor reaping, autoscaling, the status line.
pub const LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum delay before a failed stage is retried. Retrying within
/// milliseconds would hit the same NFS race the retry exists to absorb.
const STAGE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Slack when comparing memory figures that have been through an RPC.
const MEM_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error("unknown executor {0}")]
    UnknownExecutor(Uuid),
    #[error("stage {stage} is not running on executor {executor}")]
    StageNotRunning { stage: StageId, executor: Uuid },
    #[error("completion log write failed: {0}")]
    LogWrite(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coordinator-side view of one registered executor.
#[derive(Debug)]
pub struct ExecutorRecord {
    pub total_mem_gb: f64,
    pub cores: u32,
    pub reserved_mem_gb: f64,
    pub reserved_cores: u32,
    pub running: HashSet<StageId>,
    pub last_heartbeat: Instant,
    pub last_tick: u64,
    pub resident_mem_gb: f64,
}

/// What a work-requesting executor is told.
#[derive(Debug)]
pub enum WorkReply {
    Run(DispatchedStage),
    /// Nothing fits right now; poll again later.
    Wait,
    /// Drain: finish in-flight stages and exit.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DispatchedStage {
    pub stage_id: StageId,
    pub command: Vec<String>,
    pub log_file: PathBuf,
    pub memory_gb: f64,
    pub cores: u32,
}

/// Read-only progress counts.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub running: usize,
    pub runnable: usize,
    pub failed_ids: Vec<StageId>,
}

/// What the server loop should do after a supervisor tick.
#[derive(Debug)]
pub struct SupervisorVerdict {
    /// The pipeline is draining: stop launching, wait for executors.
    pub shutdown: bool,
    pub executors_to_launch: usize,
    pub memory_request_gb: f64,
    pub active_executors: usize,
    pub status: StatusSnapshot,
}

#[derive(Debug, Clone)]
pub struct FailedStage {
    pub id: StageId,
    pub command: String,
    pub log_file: PathBuf,
}

/// Final result reported at shutdown and turned into the exit code.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub total: usize,
    pub finished: usize,
    pub failed: Vec<FailedStage>,
    pub fatal: Option<String>,
}

impl PipelineOutcome {
    pub fn success(&self) -> bool {
        self.fatal.is_none() && self.failed.is_empty() && self.finished == self.total
    }
}

struct PipelineState {
    dag: StageDag,
    log: CompletionLog,
    clients: HashMap<Uuid, ExecutorRecord>,
    /// Failed stages are not retried before this instant.
    retry_after: HashMap<StageId, Instant>,
    /// Executors submitted but not yet registered.
    launched_and_waiting: usize,
    failed_executors: u32,
    fatal: Option<String>,
    draining: bool,
    restored: usize,
}

impl PipelineState {
    /// The largest executor any stage could ever be offered: the configured
    /// per-executor maximum, or a bigger executor someone registered by
    /// hand.
    fn executor_capacity_gb(&self, configured_max: f64) -> f64 {
        self.clients
            .values()
            .map(|c| c.total_mem_gb)
            .fold(configured_max, f64::max)
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            total: self.dag.total(),
            finished: self.dag.finished_count(),
            failed: self.dag.failed_count(),
            running: self.dag.running_count(),
            runnable: self.dag.runnable_count(),
            failed_ids: self.dag.failed_ids().to_vec(),
        }
    }

    fn set_fatal(&mut self, msg: String) {
        error!("{msg}");
        if self.fatal.is_none() {
            self.fatal = Some(msg);
        }
    }
}

pub struct Pipeline {
    state: Mutex<PipelineState>,
    opts: ServerOptions,
}

impl Pipeline {
    /// Validate the DAG, assign default per-stage log files, recognize
    /// previously completed stages from the completion log, and open the
    /// log for appending.
    pub fn new(mut dag: StageDag, opts: ServerOptions) -> Result<Pipeline, PipelineError> {
        dag.validate()?;

        let log_dir = opts.log_dir();
        for id in dag.stage_ids().collect::<Vec<_>>() {
            if dag.stage(id).log_file.is_none() {
                let name = dag.stage(id).name().to_string();
                dag.stage_mut(id).log_file = Some(log_dir.join(format!("{name}-{id}.log")));
            }
        }

        dag.initialize();

        let log_path = completion_log::default_path(&opts.output_dir, &opts.pipeline_name);
        let mut restored = 0;
        if !opts.no_restart {
            let previous = CompletionLog::load(&log_path)?;
            if !previous.is_empty() {
                restored = restore_finished_stages(&mut dag, &previous);
                info!(
                    restored,
                    total = dag.total(),
                    "recognized previously completed stages"
                );
            }
        }
        let log = CompletionLog::open(&log_path)?;

        Ok(Pipeline {
            state: Mutex::new(PipelineState {
                dag,
                log,
                clients: HashMap::new(),
                retry_after: HashMap::new(),
                launched_and_waiting: 0,
                failed_executors: 0,
                fatal: None,
                draining: false,
                restored,
            }),
            opts,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub async fn register_executor(&self, total_mem_gb: f64, cores: u32) -> Uuid {
        let mut st = self.state.lock().await;
        let id = Uuid::new_v4();
        st.clients.insert(
            id,
            ExecutorRecord {
                total_mem_gb,
                cores,
                reserved_mem_gb: 0.0,
                reserved_cores: 0,
                running: HashSet::new(),
                last_heartbeat: Instant::now(),
                last_tick: 0,
                resident_mem_gb: 0.0,
            },
        );
        if st.launched_and_waiting > 0 {
            st.launched_and_waiting -= 1;
        }
        info!(executor = %id, mem_gb = total_mem_gb, cores, "executor registered");
        id
    }

    /// Match the executor's free resources against the runnable frontier.
    /// The frontier is scanned in insertion order and the first fitting
    /// stage wins; its removal, RUNNING transition and reservation happen
    /// atomically under the state lock.
    pub async fn request_work(
        &self,
        executor: Uuid,
        free_mem_gb: f64,
        free_cores: u32,
    ) -> Result<WorkReply, PipelineError> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        if !st.clients.contains_key(&executor) {
            return Err(PipelineError::UnknownExecutor(executor));
        }
        if st.draining || st.fatal.is_some() || st.dag.all_finished() {
            return Ok(WorkReply::Shutdown);
        }
        // Wedged on failures: nothing runnable or running but work remains.
        if st.dag.quiescent() && st.dag.failed_count() > 0 {
            return Ok(WorkReply::Shutdown);
        }

        let now = Instant::now();
        let candidates: Vec<StageId> = st.dag.runnable().collect();
        for id in candidates {
            if st.retry_after.get(&id).is_some_and(|t| *t > now) {
                continue;
            }
            let needed = dispatch_memory(st.dag.stage_mut(id));
            let procs = st.dag.stage(id).procs;

            if needed <= free_mem_gb + MEM_EPSILON && procs <= free_cores {
                st.retry_after.remove(&id);
                st.dag.take_runnable(id);
                let client = st.clients.get_mut(&executor).expect("checked above");
                client.reserved_mem_gb += needed;
                client.reserved_cores += procs;
                client.running.insert(id);
                let stage = st.dag.stage(id);
                info!(
                    stage = id,
                    executor = %executor,
                    mem_gb = format_args!("{needed:.2}"),
                    "dispatching stage: {}",
                    stage.command_line()
                );
                return Ok(WorkReply::Run(DispatchedStage {
                    stage_id: id,
                    command: stage.cmd.clone(),
                    log_file: stage.log_file.clone().unwrap_or_default(),
                    memory_gb: needed,
                    cores: procs,
                }));
            }

            // No executor will ever satisfy this stage: fail the pipeline
            // rather than let it starve silently.
            let capacity = st.executor_capacity_gb(self.opts.mem);
            if needed > capacity + MEM_EPSILON {
                st.set_fatal(format!(
                    "insufficient resources: stage {id} requires {needed:.2} GB \
                     but at most {capacity:.2} GB is available on any executor"
                ));
                return Ok(WorkReply::Shutdown);
            }
            debug!(
                stage = id,
                needed_gb = needed,
                free_mem_gb,
                free_cores,
                "stage does not fit this executor"
            );
        }
        Ok(WorkReply::Wait)
    }

    /// Commit a successful stage: completion actions, then the write-ahead
    /// log append, then the FINISHED transition that unblocks dependents,
    /// then the reservation release. A failed log append rejects the report
    /// and leaves the stage RUNNING for the executor to re-report; a failed
    /// completion action is treated as a stage failure.
    pub async fn report_finished(
        &self,
        executor: Uuid,
        stage_id: StageId,
    ) -> Result<(), PipelineError> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let client = st
            .clients
            .get(&executor)
            .ok_or(PipelineError::UnknownExecutor(executor))?;
        if !client.running.contains(&stage_id) {
            return Err(PipelineError::StageNotRunning {
                stage: stage_id,
                executor,
            });
        }

        for action in st.dag.stage(stage_id).on_finished.clone() {
            if let Err(err) = run_completion_action(st, stage_id, &action, &self.opts) {
                warn!(
                    stage = stage_id,
                    error = %err,
                    "completion action failed; treating as stage failure"
                );
                return self.fail_stage_locked(
                    st,
                    executor,
                    stage_id,
                    format!("completion action failed: {err}"),
                );
            }
        }

        let fingerprint = st.dag.stage(stage_id).fingerprint;
        if let Err(err) = st.log.append(fingerprint) {
            error!(
                stage = stage_id,
                error = %err,
                "completion log append failed; rejecting report"
            );
            return Err(PipelineError::LogWrite(err));
        }

        release_reservation(st, executor, stage_id);
        info!(
            stage = stage_id,
            "finished stage {}: {}",
            stage_id,
            st.dag.stage(stage_id).command_line()
        );
        let unblocked = st.dag.mark_finished(stage_id);
        if !unblocked.is_empty() {
            debug!(stage = stage_id, ?unblocked, "dependents now runnable");
        }
        Ok(())
    }

    pub async fn report_failed(
        &self,
        executor: Uuid,
        stage_id: StageId,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let client = st
            .clients
            .get(&executor)
            .ok_or(PipelineError::UnknownExecutor(executor))?;
        if !client.running.contains(&stage_id) {
            return Err(PipelineError::StageNotRunning {
                stage: stage_id,
                executor,
            });
        }
        self.fail_stage_locked(st, executor, stage_id, reason.to_string())
    }

    /// Retry-or-fail decision for a stage that just failed on `executor`.
    fn fail_stage_locked(
        &self,
        st: &mut PipelineState,
        executor: Uuid,
        stage_id: StageId,
        reason: String,
    ) -> Result<(), PipelineError> {
        release_reservation(st, executor, stage_id);

        let retries = st.dag.stage(stage_id).retries;
        if retries < MAX_STAGE_RETRIES {
            st.dag.requeue(stage_id);
            st.retry_after
                .insert(stage_id, Instant::now() + STAGE_RETRY_INTERVAL);
            info!(
                stage = stage_id,
                attempt = retries + 1,
                reason = %reason,
                "stage failed; returning it to the runnable set"
            );
        } else {
            let cascaded = st.dag.mark_failed(stage_id, reason.clone());
            let stage = st.dag.stage(stage_id);
            error!(
                stage = stage_id,
                reason = %reason,
                log_file = %stage.log_file.as_deref().unwrap_or_else(|| std::path::Path::new("")).display(),
                "stage failed permanently: {}",
                stage.command_line()
            );
            for dep in cascaded {
                info!(
                    stage = dep,
                    root = stage_id,
                    "stage failed because a dependency failed"
                );
            }
        }
        Ok(())
    }

    /// Liveness bookkeeping only; strictly shorter critical section than
    /// dispatch. Heartbeats are monotonic per executor: a tick older than
    /// the last seen one is ignored.
    pub async fn heartbeat(
        &self,
        executor: Uuid,
        tick: u64,
        resident_mem_gb: f64,
    ) -> Result<(), PipelineError> {
        let mut st = self.state.lock().await;
        let client = st
            .clients
            .get_mut(&executor)
            .ok_or(PipelineError::UnknownExecutor(executor))?;
        if tick < client.last_tick {
            debug!(executor = %executor, tick, last = client.last_tick, "ignoring stale heartbeat");
            return Ok(());
        }
        client.last_tick = tick;
        client.last_heartbeat = Instant::now();
        client.resident_mem_gb = resident_mem_gb;
        debug!(executor = %executor, tick, resident_mem_gb, "heartbeat");
        Ok(())
    }

    /// Clean executor shutdown. In-flight stages (none, normally) are
    /// requeued exactly as for a lost executor.
    pub async fn unregister_executor(&self, executor: Uuid) -> Result<(), PipelineError> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let client = st
            .clients
            .remove(&executor)
            .ok_or(PipelineError::UnknownExecutor(executor))?;
        for stage_id in client.running {
            warn!(
                stage = stage_id,
                executor = %executor,
                "executor unregistered with a stage in flight; requeuing"
            );
            st.dag.requeue(stage_id);
        }
        info!(executor = %executor, "executor unregistered");
        Ok(())
    }

    pub async fn query_status(&self) -> StatusSnapshot {
        self.state.lock().await.snapshot()
    }

    /// One supervisor tick: reap silent executors, detect infeasible
    /// stages, decide whether to drain, and size the autoscale request.
    pub async fn supervise(&self) -> SupervisorVerdict {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let now = Instant::now();

        // Reap executors that have been silent past the latency tolerance.
        let tolerance = self.opts.latency_tolerance();
        let dead: Vec<Uuid> = st
            .clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_heartbeat) > tolerance)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            let client = st.clients.remove(&id).expect("collected above");
            let silent = now.duration_since(client.last_heartbeat);
            warn!(
                executor = %id,
                silent_secs = silent.as_secs(),
                "no contact with executor; declaring it lost"
            );
            for stage_id in client.running {
                st.dag.stage_mut(stage_id).status = StageStatus::Lost;
                st.dag.requeue(stage_id);
                info!(stage = stage_id, "requeued stage from lost executor");
            }
            st.failed_executors += 1;
        }

        // A runnable stage no executor could ever hold is fatal: better to
        // stop than to starve it while burning allocation.
        if st.fatal.is_none() {
            if let Some(max_needed) = st.dag.max_runnable_memory_gb() {
                let capacity = st.executor_capacity_gb(self.opts.mem);
                if max_needed > capacity + MEM_EPSILON {
                    st.set_fatal(format!(
                        "insufficient resources: a stage requires {max_needed:.2} GB \
                         but at most {capacity:.2} GB is available on any executor"
                    ));
                }
            }
        }

        let shutdown = if st.draining || st.fatal.is_some() {
            true
        } else if st.dag.all_finished() {
            info!("all stages complete");
            true
        } else if st.dag.quiescent() {
            error!("no more runnable stages, but not all stages have finished");
            true
        } else if st.dag.runnable_count() > 0
            && st.clients.is_empty()
            && st.launched_and_waiting == 0
            && st.failed_executors > self.opts.max_failed_executors
        {
            error!(
                failed_executors = st.failed_executors,
                "too many executors lost and none remain; shutting down"
            );
            true
        } else {
            false
        };
        if shutdown {
            st.draining = true;
        }

        let mut executors_to_launch = 0;
        let mut memory_request_gb = 0.0;
        if !st.draining
            && self.opts.num_executors > 0
            && st.failed_executors <= self.opts.max_failed_executors
        {
            let active = st.clients.len() + st.launched_and_waiting;
            let room = (self.opts.num_executors as usize).saturating_sub(active);
            executors_to_launch = room.min(st.dag.runnable_count());
            if executors_to_launch > 0 {
                let needed = st
                    .dag
                    .max_runnable_memory_gb()
                    .unwrap_or(self.opts.default_job_mem);
                memory_request_gb = if self.opts.greedy {
                    self.opts.mem
                } else {
                    needed.min(self.opts.mem)
                };
            }
        }

        SupervisorVerdict {
            shutdown: st.draining,
            executors_to_launch,
            memory_request_gb,
            active_executors: st.clients.len(),
            status: st.snapshot(),
        }
    }

    /// Record that executors have been submitted but not yet registered.
    pub async fn note_launched(&self, count: usize) {
        self.state.lock().await.launched_and_waiting += count;
    }

    /// SIGINT/SIGTERM path: stop handing out work; executors drain.
    pub async fn initiate_shutdown(&self) {
        let mut st = self.state.lock().await;
        if !st.draining {
            info!("shutdown requested; draining executors");
            st.draining = true;
        }
    }

    pub async fn active_executors(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn outcome(&self) -> PipelineOutcome {
        let st = self.state.lock().await;
        PipelineOutcome {
            total: st.dag.total(),
            finished: st.dag.finished_count(),
            failed: st
                .dag
                .failed_ids()
                .iter()
                .map(|&id| {
                    let stage = st.dag.stage(id);
                    FailedStage {
                        id,
                        command: stage.command_line(),
                        log_file: stage.log_file.clone().unwrap_or_default(),
                    }
                })
                .collect(),
            fatal: st.fatal.clone(),
        }
    }

    /// Stages recognized as already finished at startup.
    pub async fn restored_count(&self) -> usize {
        self.state.lock().await.restored
    }

    pub async fn stage_state(&self, id: StageId) -> (StageStatus, u32) {
        let st = self.state.lock().await;
        let stage = st.dag.stage(id);
        (stage.status, stage.retries)
    }

    pub async fn stage_fingerprint(&self, id: StageId) -> Fingerprint {
        self.state.lock().await.dag.stage(id).fingerprint
    }
}

/// The memory figure for a dispatch attempt. Deferred estimates are
/// evaluated here; `RecomputeMemory` forces re-evaluation on every attempt
/// so that retries see current input sizes.
fn dispatch_memory(stage: &mut Stage) -> f64 {
    let recompute = stage
        .on_runnable
        .iter()
        .any(|a| matches!(a, RunnableAction::RecomputeMemory));
    if recompute || stage.cached_mem.is_none() {
        let gb = stage.mem.evaluate(&stage.inputs);
        stage.cached_mem = Some(gb);
    }
    stage.cached_mem.unwrap_or_default()
}

fn release_reservation(st: &mut PipelineState, executor: Uuid, stage_id: StageId) {
    let mem = st.dag.stage(stage_id).memory_gb();
    let procs = st.dag.stage(stage_id).procs;
    if let Some(client) = st.clients.get_mut(&executor) {
        client.running.remove(&stage_id);
        client.reserved_mem_gb = (client.reserved_mem_gb - mem).max(0.0);
        client.reserved_cores = client.reserved_cores.saturating_sub(procs);
    }
}

fn run_completion_action(
    st: &mut PipelineState,
    stage_id: StageId,
    action: &CompletionAction,
    opts: &ServerOptions,
) -> anyhow::Result<()> {
    match action {
        CompletionAction::EmitVerificationRecord => {
            let manifest = opts.verification_manifest();
            if let Some(parent) = manifest.parent() {
                fs::create_dir_all(parent)?;
            }
            let stage = st.dag.stage(stage_id);
            let output = stage
                .outputs
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let mut file = OpenOptions::new().create(true).append(true).open(&manifest)?;
            writeln!(file, "{stage_id}\t{output}\t{}", stage.command_line())?;
            debug!(stage = stage_id, manifest = %manifest.display(), "verification record emitted");
        }
        CompletionAction::RegisterFollowup { spec } => {
            let followup = Stage::from_spec((**spec).clone(), opts.default_job_mem);
            let new_id = st.dag.add_followup(stage_id, followup);
            info!(
                stage = stage_id,
                followup = new_id,
                "registered followup stage"
            );
        }
    }
    Ok(())
}

/// Walk the frontier marking stages whose fingerprint appears in a previous
/// run's log as finished (without re-appending) until only genuinely
/// runnable work remains.
fn restore_finished_stages(dag: &mut StageDag, previous: &HashSet<Fingerprint>) -> usize {
    let mut queue: VecDeque<StageId> = dag.runnable().collect();
    let mut restored = 0;
    while let Some(id) = queue.pop_front() {
        if previous.contains(&dag.stage(id).fingerprint) {
            dag.take_runnable(id);
            let unblocked = dag.mark_finished(id);
            restored += 1;
            queue.extend(unblocked);
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{MemoryEstimate, PipelineSpec, StageSpec};
    use clap::Parser as _;
    use std::path::Path;

    fn spec(cmd: &[&str]) -> StageSpec {
        StageSpec {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            inputs: vec![],
            outputs: vec![],
            mem: None,
            procs: 1,
            log_file: None,
            on_runnable: vec![],
            on_finished: vec![],
        }
    }

    fn opts(dir: &Path, extra: &[&str]) -> ServerOptions {
        let mut args = vec![
            "pipeline-server".to_string(),
            "--output-dir".to_string(),
            dir.display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        ServerOptions::parse_from(args)
    }

    fn pipeline_from(
        stages: Vec<StageSpec>,
        edges: Vec<[StageId; 2]>,
        options: ServerOptions,
    ) -> Pipeline {
        let dag = StageDag::from_spec(PipelineSpec { stages, edges }, options.default_job_mem)
            .expect("valid spec");
        Pipeline::new(dag, options).expect("pipeline builds")
    }

    async fn dispatch_one(pipeline: &Pipeline, executor: Uuid, mem: f64, cores: u32) -> StageId {
        match pipeline.request_work(executor, mem, cores).await.unwrap() {
            WorkReply::Run(d) => d.stage_id,
            other => panic!("expected a stage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn linear_chain_runs_in_order_with_write_ahead_log() {
        let dir = tempfile::tempdir().unwrap();
        let options = opts(dir.path(), &[]);
        let pipeline = pipeline_from(
            vec![spec(&["echo", "a"]), spec(&["echo", "b"]), spec(&["echo", "c"])],
            vec![[0, 1], [1, 2]],
            options,
        );
        let fps = [
            pipeline.stage_fingerprint(0).await,
            pipeline.stage_fingerprint(1).await,
            pipeline.stage_fingerprint(2).await,
        ];

        let executor = pipeline.register_executor(4.0, 2).await;
        for expect in 0..3u32 {
            let got = dispatch_one(&pipeline, executor, 4.0, 2).await;
            assert_eq!(got, expect);
            pipeline.report_finished(executor, got).await.unwrap();

            // Write-ahead: the fingerprint is on disk by the time the next
            // stage can possibly be observed runnable.
            let log_path =
                completion_log::default_path(dir.path(), &pipeline.options().pipeline_name);
            let text = std::fs::read_to_string(&log_path).unwrap();
            assert!(text.contains(&fps[expect as usize].to_string()));
        }

        // Log order matches completion order.
        let log_path = completion_log::default_path(dir.path(), &pipeline.options().pipeline_name);
        let text = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            fps.iter().map(|f| f.to_string()).collect::<Vec<_>>()
        );

        // Everything done: the executor is told to drain.
        assert!(matches!(
            pipeline.request_work(executor, 4.0, 2).await.unwrap(),
            WorkReply::Shutdown
        ));
        assert!(pipeline.outcome().await.success());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_from(vec![spec(&["false"])], vec![], opts(dir.path(), &[]));
        let executor = pipeline.register_executor(4.0, 1).await;

        for attempt in 0..2 {
            let id = dispatch_one(&pipeline, executor, 4.0, 1).await;
            pipeline
                .report_failed(executor, id, "exit status 1")
                .await
                .unwrap();
            let (status, retries) = pipeline.stage_state(id).await;
            assert_eq!(status, StageStatus::Runnable);
            assert_eq!(retries, attempt + 1);
            // Not eligible again until the retry interval passes.
            assert!(matches!(
                pipeline.request_work(executor, 4.0, 1).await.unwrap(),
                WorkReply::Wait
            ));
            tokio::time::sleep(STAGE_RETRY_INTERVAL + Duration::from_millis(100)).await;
        }

        let id = dispatch_one(&pipeline, executor, 4.0, 1).await;
        pipeline.report_finished(executor, id).await.unwrap();
        let (status, retries) = pipeline.stage_state(id).await;
        assert_eq!(status, StageStatus::Finished);
        assert_eq!(retries, 2);
        assert!(pipeline.outcome().await.success());
    }

    #[tokio::test]
    async fn permanent_failure_cascades_but_spares_independent_work() {
        let dir = tempfile::tempdir().unwrap();
        // a -> b, c independent; b is never dispatched because a fails.
        // c needs 3 GB so that a 2 GB offer can only ever pick a.
        let mut c = spec(&["echo", "c"]);
        c.mem = Some(MemoryEstimate::Fixed { gb: 3.0 });
        let pipeline = pipeline_from(
            vec![spec(&["false"]), spec(&["echo", "b"]), c],
            vec![[0, 1]],
            opts(dir.path(), &[]),
        );
        let executor = pipeline.register_executor(4.0, 2).await;

        for _ in 0..3 {
            let id = dispatch_one(&pipeline, executor, 2.0, 2).await;
            assert_eq!(id, 0);
            pipeline
                .report_failed(executor, id, "exit status 1")
                .await
                .unwrap();
            tokio::time::sleep(STAGE_RETRY_INTERVAL + Duration::from_millis(100)).await;
        }
        let (status, retries) = pipeline.stage_state(0).await;
        assert_eq!(status, StageStatus::Failed);
        assert_eq!(retries, MAX_STAGE_RETRIES);
        assert_eq!(pipeline.stage_state(1).await.0, StageStatus::Failed);

        // The independent stage still runs to completion.
        let id = dispatch_one(&pipeline, executor, 4.0, 2).await;
        assert_eq!(id, 2);
        pipeline.report_finished(executor, id).await.unwrap();

        let status = pipeline.query_status().await;
        assert_eq!(status.finished, 1);
        assert_eq!(status.failed, 2);
        assert_eq!(status.failed_ids, vec![0, 1]);

        // Wedged: failures block the rest, so executors are drained.
        assert!(matches!(
            pipeline.request_work(executor, 4.0, 2).await.unwrap(),
            WorkReply::Shutdown
        ));
        assert!(!pipeline.outcome().await.success());
    }

    #[tokio::test]
    async fn lost_executor_stages_are_requeued_and_rerun() {
        let dir = tempfile::tempdir().unwrap();
        // Tolerance of 0.0005 minutes = 30ms so the test reaps quickly.
        let options = opts(dir.path(), &["--latency-tolerance", "0.0005"]);
        let pipeline = pipeline_from(
            vec![spec(&["echo", "s1"]), spec(&["echo", "s2"])],
            vec![],
            options,
        );

        let e1 = pipeline.register_executor(4.0, 2).await;
        let s1 = dispatch_one(&pipeline, e1, 4.0, 2).await;
        let s2 = dispatch_one(&pipeline, e1, 4.0, 2).await;

        // e1 goes silent; the supervisor declares it lost.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let verdict = pipeline.supervise().await;
        assert!(!verdict.shutdown);
        assert_eq!(verdict.active_executors, 0);
        assert_eq!(pipeline.stage_state(s1).await, (StageStatus::Runnable, 1));
        assert_eq!(pipeline.stage_state(s2).await, (StageStatus::Runnable, 1));

        // Stale reports from the dead executor are rejected.
        assert!(pipeline.report_finished(e1, s1).await.is_err());

        // A fresh executor picks the stages up and completes them.
        let e2 = pipeline.register_executor(4.0, 2).await;
        let r1 = dispatch_one(&pipeline, e2, 4.0, 2).await;
        let r2 = dispatch_one(&pipeline, e2, 4.0, 2).await;
        assert_eq!(
            {
                let mut v = vec![r1, r2];
                v.sort();
                v
            },
            vec![s1, s2]
        );
        pipeline.report_finished(e2, r1).await.unwrap();
        pipeline.report_finished(e2, r2).await.unwrap();
        assert!(pipeline.outcome().await.success());
    }

    #[tokio::test]
    async fn restart_recognizes_completed_stages_without_reexecution() {
        let dir = tempfile::tempdir().unwrap();
        let stages = || {
            vec![
                spec(&["echo", "0"]),
                spec(&["echo", "1"]),
                spec(&["echo", "2"]),
                spec(&["echo", "3"]),
                spec(&["echo", "4"]),
            ]
        };
        let edges = vec![[0, 2], [1, 2], [2, 3], [2, 4]];

        // First run is interrupted after three stages logged completion.
        {
            let pipeline = pipeline_from(stages(), edges.clone(), opts(dir.path(), &[]));
            let executor = pipeline.register_executor(4.0, 4).await;
            for _ in 0..3 {
                let id = dispatch_one(&pipeline, executor, 4.0, 4).await;
                pipeline.report_finished(executor, id).await.unwrap();
            }
        }

        // Restart against the same working directory and identical DAG.
        let pipeline = pipeline_from(stages(), edges.clone(), opts(dir.path(), &[]));
        assert_eq!(pipeline.restored_count().await, 3);
        let status = pipeline.query_status().await;
        assert_eq!(status.finished, 3);
        assert_eq!(status.runnable, 2);

        let executor = pipeline.register_executor(4.0, 4).await;
        let mut executed = 0;
        loop {
            match pipeline.request_work(executor, 4.0, 4).await.unwrap() {
                WorkReply::Run(d) => {
                    executed += 1;
                    pipeline.report_finished(executor, d.stage_id).await.unwrap();
                }
                WorkReply::Shutdown => break,
                WorkReply::Wait => panic!("nothing should block"),
            }
        }
        assert_eq!(executed, 2);
        assert!(pipeline.outcome().await.success());

        // A second restart recognizes everything and executes nothing.
        let pipeline = pipeline_from(stages(), edges, opts(dir.path(), &[]));
        assert_eq!(pipeline.restored_count().await, 5);
        let executor = pipeline.register_executor(4.0, 4).await;
        assert!(matches!(
            pipeline.request_work(executor, 4.0, 4).await.unwrap(),
            WorkReply::Shutdown
        ));
    }

    #[tokio::test]
    async fn oversized_stage_is_fatal_insufficient_resources() {
        let dir = tempfile::tempdir().unwrap();
        let mut big = spec(&["pmincaverage", "everything.mnc"]);
        big.mem = Some(MemoryEstimate::Fixed { gb: 32.0 });
        let options = opts(dir.path(), &["--mem", "16"]);
        let pipeline = pipeline_from(vec![big], vec![], options);

        let executor = pipeline.register_executor(16.0, 4).await;
        assert!(matches!(
            pipeline.request_work(executor, 16.0, 4).await.unwrap(),
            WorkReply::Shutdown
        ));
        let outcome = pipeline.outcome().await;
        assert!(outcome.fatal.as_deref().unwrap().contains("insufficient resources"));

        let verdict = pipeline.supervise().await;
        assert!(verdict.shutdown);
    }

    #[tokio::test]
    async fn dispatch_skips_stages_too_big_for_this_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mut heavy = spec(&["mincANTS", "big.mnc"]);
        heavy.mem = Some(MemoryEstimate::Fixed { gb: 10.0 });
        let mut light = spec(&["mincblur", "small.mnc"]);
        light.mem = Some(MemoryEstimate::Fixed { gb: 1.0 });
        let options = opts(dir.path(), &["--mem", "16"]);
        let pipeline = pipeline_from(vec![heavy, light], vec![], options);

        // 4 GB free: the 10 GB stage is skipped, the 1 GB one dispatched.
        let executor = pipeline.register_executor(4.0, 2).await;
        let id = dispatch_one(&pipeline, executor, 4.0, 2).await;
        assert_eq!(id, 1);

        // Nothing else fits this executor, but a 16 GB executor exists in
        // configuration, so the answer is wait rather than fatal.
        assert!(matches!(
            pipeline.request_work(executor, 3.0, 1).await.unwrap(),
            WorkReply::Wait
        ));
        assert!(pipeline.outcome().await.fatal.is_none());
    }

    #[tokio::test]
    async fn stale_heartbeats_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_from(vec![spec(&["true"])], vec![], opts(dir.path(), &[]));
        let executor = pipeline.register_executor(4.0, 1).await;

        pipeline.heartbeat(executor, 5, 0.5).await.unwrap();
        pipeline.heartbeat(executor, 3, 9.9).await.unwrap();
        let st = pipeline.state.lock().await;
        let client = st.clients.get(&executor).unwrap();
        assert_eq!(client.last_tick, 5);
        assert!((client.resident_mem_gb - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn completion_actions_emit_records_and_followups() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = spec(&["mincresample", "native.mnc"]);
        first.outputs = vec![dir.path().join("resampled.mnc")];
        first.on_finished = vec![
            CompletionAction::EmitVerificationRecord,
            CompletionAction::RegisterFollowup {
                spec: Box::new(spec(&["mincpik", "resampled.mnc"])),
            },
        ];
        let pipeline = pipeline_from(vec![first], vec![], opts(dir.path(), &[]));

        let executor = pipeline.register_executor(4.0, 1).await;
        let id = dispatch_one(&pipeline, executor, 4.0, 1).await;
        pipeline.report_finished(executor, id).await.unwrap();

        let manifest =
            std::fs::read_to_string(pipeline.options().verification_manifest()).unwrap();
        assert!(manifest.contains("resampled.mnc"));

        // The followup is now part of the pipeline and runnable.
        let status = pipeline.query_status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.runnable, 1);
        let follow = dispatch_one(&pipeline, executor, 4.0, 1).await;
        pipeline.report_finished(executor, follow).await.unwrap();
        assert!(pipeline.outcome().await.success());
    }

    #[tokio::test]
    async fn reservations_track_running_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = spec(&["echo", "a"]);
        a.mem = Some(MemoryEstimate::Fixed { gb: 2.0 });
        let mut b = spec(&["echo", "b"]);
        b.mem = Some(MemoryEstimate::Fixed { gb: 3.0 });
        let pipeline = pipeline_from(vec![a, b], vec![], opts(dir.path(), &[]));

        let executor = pipeline.register_executor(6.0, 2).await;
        dispatch_one(&pipeline, executor, 6.0, 2).await;
        dispatch_one(&pipeline, executor, 4.0, 1).await;
        {
            let st = pipeline.state.lock().await;
            let client = st.clients.get(&executor).unwrap();
            assert!((client.reserved_mem_gb - 5.0).abs() < 1e-9);
            assert_eq!(client.reserved_cores, 2);
            assert_eq!(client.running.len(), 2);
        }
        pipeline.report_finished(executor, 0).await.unwrap();
        {
            let st = pipeline.state.lock().await;
            let client = st.clients.get(&executor).unwrap();
            assert!((client.reserved_mem_gb - 3.0).abs() < 1e-9);
            assert_eq!(client.reserved_cores, 1);
        }
    }
}
