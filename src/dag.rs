//! Stage DAG with an incrementally-maintained runnable frontier.
//!
//! Stages are dense `u32` indices into an adjacency list. Each stage
//! carries a counter of unfinished predecessors; finishing a stage
//! decrements the counters of its dependents and enqueues any that reach
//! zero, so a completion costs O(out-degree) rather than a graph re-scan.
//! The runnable frontier is a FIFO of stage ids (insertion order) with a
//! membership bitmap, which is what the dispatch policy iterates.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::stage::{FailureCause, PipelineSpec, Stage, StageId, StageStatus};

#[derive(Debug, Error)]
pub enum DagError {
    #[error("stage graph contains a cycle ({remaining} stages cannot be ordered)")]
    Cycle { remaining: usize },
    #[error("unknown stage id {0}")]
    UnknownStage(StageId),
    #[error("stage {0} cannot depend on itself")]
    SelfDependency(StageId),
    #[error("dependency edge added after initialization")]
    AlreadyInitialized,
}

pub struct StageDag {
    stages: Vec<Stage>,
    successors: Vec<Vec<StageId>>,
    predecessors: Vec<Vec<StageId>>,
    /// Unfinished-predecessor counters; zero iff the stage has left
    /// `NotStarted`.
    unfinished_preds: Vec<usize>,
    runnable: VecDeque<StageId>,
    in_runnable: Vec<bool>,
    by_fingerprint: HashMap<Fingerprint, StageId>,
    by_output: HashMap<PathBuf, StageId>,
    failed: Vec<StageId>,
    num_finished: usize,
    initialized: bool,
}

impl StageDag {
    pub fn new() -> StageDag {
        StageDag {
            stages: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            unfinished_preds: Vec::new(),
            runnable: VecDeque::new(),
            in_runnable: Vec::new(),
            by_fingerprint: HashMap::new(),
            by_output: HashMap::new(),
            failed: Vec::new(),
            num_finished: 0,
            initialized: false,
        }
    }

    /// Build a DAG from a pipeline description: construct every stage, add
    /// the explicit edges, then derive producer/consumer edges from
    /// matching output and input paths.
    pub fn from_spec(spec: PipelineSpec, default_job_mem_gb: f64) -> Result<StageDag, DagError> {
        let mut dag = StageDag::new();
        for stage_spec in spec.stages {
            dag.add_stage(Stage::from_spec(stage_spec, default_job_mem_gb));
        }
        for [from, to] in spec.edges {
            dag.add_dependency(from, to)?;
        }
        dag.connect_by_files();
        Ok(dag)
    }

    /// Add a stage, deduplicating on fingerprint: adding a stage whose
    /// semantics are already present returns the existing id.
    pub fn add_stage(&mut self, stage: Stage) -> StageId {
        if let Some(&existing) = self.by_fingerprint.get(&stage.fingerprint) {
            debug!(stage = existing, "skipping duplicate stage");
            return existing;
        }
        let id = self.stages.len() as StageId;
        self.by_fingerprint.insert(stage.fingerprint, id);
        for output in &stage.outputs {
            self.by_output.insert(output.clone(), id);
        }
        self.stages.push(stage);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
        self.unfinished_preds.push(0);
        self.in_runnable.push(false);
        id
    }

    /// Record that `to` can only run once `from` has finished.
    pub fn add_dependency(&mut self, from: StageId, to: StageId) -> Result<(), DagError> {
        if self.initialized {
            return Err(DagError::AlreadyInitialized);
        }
        let n = self.stages.len() as StageId;
        if from >= n {
            return Err(DagError::UnknownStage(from));
        }
        if to >= n {
            return Err(DagError::UnknownStage(to));
        }
        if from == to {
            return Err(DagError::SelfDependency(from));
        }
        if self.successors[from as usize].contains(&to) {
            return Ok(());
        }
        self.successors[from as usize].push(to);
        self.predecessors[to as usize].push(from);
        Ok(())
    }

    /// Derive dependencies by matching outputs to inputs: the producer of a
    /// file precedes every stage that reads it.
    pub fn connect_by_files(&mut self) {
        let mut edges = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            for input in &stage.inputs {
                if let Some(&producer) = self.by_output.get(input) {
                    if producer != i as StageId {
                        edges.push((producer, i as StageId));
                    }
                }
            }
        }
        for (from, to) in edges {
            // Bounds already checked; duplicate edges are filtered.
            let _ = self.add_dependency(from, to);
        }
    }

    /// Kahn's algorithm over the full graph. Fails if any stage cannot be
    /// topologically ordered.
    pub fn validate(&self) -> Result<(), DagError> {
        let n = self.stages.len();
        let mut counts: Vec<usize> = (0..n).map(|i| self.predecessors[i].len()).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| counts[i] == 0).collect();
        let mut ordered = 0;
        while let Some(i) = queue.pop_front() {
            ordered += 1;
            for &succ in &self.successors[i] {
                counts[succ as usize] -= 1;
                if counts[succ as usize] == 0 {
                    queue.push_back(succ as usize);
                }
            }
        }
        if ordered < n {
            return Err(DagError::Cycle {
                remaining: n - ordered,
            });
        }
        Ok(())
    }

    /// Compute predecessor counters and enqueue the graph heads. Called
    /// once, after all stages and explicit edges have been added.
    pub fn initialize(&mut self) {
        for i in 0..self.stages.len() {
            self.unfinished_preds[i] = self.predecessors[i]
                .iter()
                .filter(|&&p| !self.stages[p as usize].is_finished())
                .count();
        }
        for i in 0..self.stages.len() as StageId {
            if self.unfinished_preds[i as usize] == 0 {
                self.enqueue(i);
            }
        }
        self.initialized = true;
    }

    fn enqueue(&mut self, id: StageId) {
        if self.in_runnable[id as usize] {
            return;
        }
        self.stages[id as usize].status = StageStatus::Runnable;
        self.in_runnable[id as usize] = true;
        self.runnable.push_back(id);
    }

    /// The runnable frontier in insertion order.
    pub fn runnable(&self) -> impl Iterator<Item = StageId> + '_ {
        self.runnable.iter().copied()
    }

    /// Remove a specific stage from the frontier and mark it running.
    /// Panics if the stage is not currently runnable (a dispatch of a
    /// non-runnable stage is a coordinator bug).
    pub fn take_runnable(&mut self, id: StageId) {
        assert!(
            self.in_runnable[id as usize],
            "stage {} dispatched while not runnable",
            id
        );
        self.runnable.retain(|&s| s != id);
        self.in_runnable[id as usize] = false;
        self.stages[id as usize].status = StageStatus::Running;
    }

    /// Mark a running stage finished and unblock its dependents. Returns
    /// the ids that became runnable. Finishing a stage twice is an error:
    /// the predecessor counters would go wrong silently otherwise.
    pub fn mark_finished(&mut self, id: StageId) -> Vec<StageId> {
        let stage = &mut self.stages[id as usize];
        assert!(
            !stage.is_finished(),
            "stage {} finished more than once",
            id
        );
        stage.status = StageStatus::Finished;
        self.num_finished += 1;
        let mut newly_runnable = Vec::new();
        for s in 0..self.successors[id as usize].len() {
            let succ = self.successors[id as usize][s];
            self.unfinished_preds[succ as usize] -= 1;
            if self.unfinished_preds[succ as usize] == 0
                && self.stages[succ as usize].status == StageStatus::NotStarted
            {
                self.enqueue(succ);
                newly_runnable.push(succ);
            }
        }
        newly_runnable
    }

    /// Return a running stage to the frontier for another attempt,
    /// incrementing its retry counter. Used both for command failures
    /// within the retry budget and for executor-lost requeues.
    pub fn requeue(&mut self, id: StageId) {
        let stage = &mut self.stages[id as usize];
        stage.retries += 1;
        self.enqueue(id);
    }

    /// Mark a stage failed for good and propagate dependency-failure to
    /// every transitive dependent. Returns the dependents that were failed.
    pub fn mark_failed(&mut self, id: StageId, reason: String) -> Vec<StageId> {
        self.stages[id as usize].status = StageStatus::Failed;
        self.stages[id as usize].failure = Some(FailureCause::Command { reason });
        self.failed.push(id);

        let mut cascaded = Vec::new();
        let mut queue: VecDeque<StageId> = self.successors[id as usize].iter().copied().collect();
        while let Some(dep) = queue.pop_front() {
            let stage = &mut self.stages[dep as usize];
            if stage.status == StageStatus::Failed {
                continue;
            }
            stage.status = StageStatus::Failed;
            stage.failure = Some(FailureCause::DependencyFailed { root: id });
            self.failed.push(dep);
            cascaded.push(dep);
            if self.in_runnable[dep as usize] {
                self.runnable.retain(|&s| s != dep);
                self.in_runnable[dep as usize] = false;
            }
            queue.extend(self.successors[dep as usize].iter().copied());
        }
        cascaded
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id as usize]
    }

    /// Direct dependents of a stage.
    pub fn dependents_of(&self, id: StageId) -> &[StageId] {
        &self.successors[id as usize]
    }

    pub fn stage_mut(&mut self, id: StageId) -> &mut Stage {
        &mut self.stages[id as usize]
    }

    /// Register a followup stage produced by a completion action of
    /// `after`, which has already finished. The new stage inherits a
    /// dependency on `after` and is immediately runnable unless it has
    /// other unfinished predecessors (it never does today).
    pub fn add_followup(&mut self, after: StageId, stage: Stage) -> StageId {
        let before = self.stages.len();
        let id = self.add_stage(stage);
        if id as usize == before {
            self.predecessors[id as usize].push(after);
            self.successors[after as usize].push(id);
            self.unfinished_preds[id as usize] = 0;
            self.enqueue(id);
        }
        id
    }

    pub fn total(&self) -> usize {
        self.stages.len()
    }

    pub fn finished_count(&self) -> usize {
        self.num_finished
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn failed_ids(&self) -> &[StageId] {
        &self.failed
    }

    pub fn runnable_count(&self) -> usize {
        self.runnable.len()
    }

    pub fn running_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .count()
    }

    /// Every stage is finished: the pipeline succeeded.
    pub fn all_finished(&self) -> bool {
        self.num_finished == self.stages.len()
    }

    /// Nothing is runnable or running: either done, or wedged on failures.
    pub fn quiescent(&self) -> bool {
        self.runnable.is_empty() && self.running_count() == 0
    }

    /// Largest memory estimate over the runnable frontier. `None` when the
    /// frontier is empty.
    pub fn max_runnable_memory_gb(&self) -> Option<f64> {
        self.runnable
            .iter()
            .map(|&id| self.stages[id as usize].memory_gb())
            .fold(None, |acc, gb| {
                Some(match acc {
                    Some(best) if best >= gb => best,
                    _ => gb,
                })
            })
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = StageId> {
        0..self.stages.len() as StageId
    }
}

impl Default for StageDag {
    fn default() -> Self {
        Self::new()
    }
}
