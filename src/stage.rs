//! Pipeline stages: the atomic unit of scheduled work.
//!
//! A stage is a single external-command execution with input/output file
//! annotations, a memory estimate (constant, or derived from input file
//! sizes at dispatch time), and optional hook actions the coordinator
//! evaluates when the stage becomes runnable or finishes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, FingerprintBuilder};

pub type StageId = u32;

/// A failed stage is retried this many times before it is declared failed
/// for good. Transient non-zero exits (NFS races) motivate the retries.
pub const MAX_STAGE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Waiting on unfinished predecessors.
    NotStarted,
    /// All predecessors finished; in the runnable frontier.
    Runnable,
    /// Dispatched to an executor.
    Running,
    /// Completed successfully (terminal).
    Finished,
    /// Exceeded retries, or a predecessor failed (terminal).
    Failed,
    /// Its executor stopped heartbeating; about to be requeued.
    Lost,
}

/// Why a stage ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The command itself failed on its final attempt.
    Command { reason: String },
    /// A transitive predecessor failed; the stage was never attempted.
    DependencyFailed { root: StageId },
}

/// How much memory a stage needs, in gigabytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEstimate {
    /// A constant declared by the stage builder.
    Fixed { gb: f64 },
    /// Derived from the on-disk size of the input files at dispatch time:
    /// `base_gb + gb_per_input_gb * total_input_gb`.
    FromInputs { base_gb: f64, gb_per_input_gb: f64 },
}

impl MemoryEstimate {
    /// Evaluate the estimate. For `FromInputs` this stats the input files;
    /// files that are missing or unreadable contribute zero.
    pub fn evaluate(&self, inputs: &[PathBuf]) -> f64 {
        match *self {
            MemoryEstimate::Fixed { gb } => gb,
            MemoryEstimate::FromInputs {
                base_gb,
                gb_per_input_gb,
            } => {
                let total_bytes: u64 = inputs
                    .iter()
                    .filter_map(|p| std::fs::metadata(p).ok())
                    .map(|m| m.len())
                    .sum();
                let total_gb = total_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
                base_gb + gb_per_input_gb * total_gb
            }
        }
    }

    /// Whether evaluation must be deferred to dispatch time.
    pub fn is_deferred(&self) -> bool {
        matches!(self, MemoryEstimate::FromInputs { .. })
    }
}

/// Actions evaluated by the coordinator just before a stage's first
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnableAction {
    /// Re-derive the cached memory estimate from current input file sizes.
    RecomputeMemory,
}

/// Actions evaluated by the coordinator when a stage finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CompletionAction {
    /// Append a record describing the stage's first output to the
    /// pipeline's verification manifest.
    EmitVerificationRecord,
    /// Add a new stage depending on this one (e.g. a verification-image
    /// conversion of the stage's output).
    RegisterFollowup { spec: Box<StageSpec> },
}

fn default_procs() -> u32 {
    1
}

/// Builder-facing stage description. Also the JSON pipeline-file format
/// consumed by `pipeline-server --stages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Program plus arguments.
    pub cmd: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Defaults to the pipeline's default job memory when absent.
    #[serde(default)]
    pub mem: Option<MemoryEstimate>,
    #[serde(default = "default_procs")]
    pub procs: u32,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub on_runnable: Vec<RunnableAction>,
    #[serde(default)]
    pub on_finished: Vec<CompletionAction>,
}

/// A full pipeline description: stages plus explicit dependency edges
/// (`[from, to]` index pairs). Producer/consumer edges implied by matching
/// output and input paths are derived automatically on top of these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub edges: Vec<[StageId; 2]>,
}

/// A stage as held by the coordinator. Constructed once during DAG build;
/// only status, retries and the cached memory estimate mutate afterwards.
#[derive(Debug, Clone)]
pub struct Stage {
    pub cmd: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub mem: MemoryEstimate,
    /// Estimate evaluated at dispatch time, at most once per dispatch
    /// attempt. `RecomputeMemory` re-evaluates it on every attempt.
    pub cached_mem: Option<f64>,
    pub procs: u32,
    pub status: StageStatus,
    pub retries: u32,
    pub failure: Option<FailureCause>,
    pub on_runnable: Vec<RunnableAction>,
    pub on_finished: Vec<CompletionAction>,
    pub fingerprint: Fingerprint,
}

impl Stage {
    /// Build a stage from its spec, filling in the pipeline default memory
    /// estimate when the builder declared none.
    pub fn from_spec(spec: StageSpec, default_job_mem_gb: f64) -> Stage {
        let mem = spec.mem.unwrap_or(MemoryEstimate::Fixed {
            gb: default_job_mem_gb,
        });
        let fingerprint = compute_fingerprint(&spec.cmd, &spec.inputs, &mem, spec.procs);
        let cached_mem = match mem {
            MemoryEstimate::Fixed { gb } => Some(gb),
            MemoryEstimate::FromInputs { .. } => None,
        };
        Stage {
            cmd: spec.cmd,
            inputs: spec.inputs,
            outputs: spec.outputs,
            log_file: spec.log_file,
            mem,
            cached_mem,
            procs: spec.procs,
            status: StageStatus::NotStarted,
            retries: 0,
            failure: None,
            on_runnable: spec.on_runnable,
            on_finished: spec.on_finished,
            fingerprint,
        }
    }

    /// Short name for log files and status lines: the program's basename.
    pub fn name(&self) -> &str {
        self.cmd
            .first()
            .map(|p| {
                Path::new(p)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(p.as_str())
            })
            .unwrap_or("<empty>")
    }

    /// The full command line, for operator-facing messages.
    pub fn command_line(&self) -> String {
        self.cmd.join(" ")
    }

    pub fn is_finished(&self) -> bool {
        self.status == StageStatus::Finished
    }

    /// The memory figure used for dispatch and reservations. Deferred
    /// estimates that have not been evaluated yet fall back to their base.
    pub fn memory_gb(&self) -> f64 {
        if let Some(gb) = self.cached_mem {
            return gb;
        }
        match self.mem {
            MemoryEstimate::Fixed { gb } => gb,
            MemoryEstimate::FromInputs { base_gb, .. } => base_gb,
        }
    }
}

/// Hash the fields that define a stage's semantics. Inputs that change the
/// command's behavior (the memory parameters, the core count) are hashed
/// alongside the command vector and input paths.
fn compute_fingerprint(
    cmd: &[String],
    inputs: &[PathBuf],
    mem: &MemoryEstimate,
    procs: u32,
) -> Fingerprint {
    let mut b = FingerprintBuilder::new();
    b.section("cmd");
    for token in cmd {
        b.str(token);
    }
    b.section("inputs");
    for input in inputs {
        b.path(input);
    }
    b.section("mem");
    match *mem {
        MemoryEstimate::Fixed { gb } => {
            b.u32(0).f64(gb);
        }
        MemoryEstimate::FromInputs {
            base_gb,
            gb_per_input_gb,
        } => {
            b.u32(1).f64(base_gb).f64(gb_per_input_gb);
        }
    }
    b.section("procs").u32(procs);
    b.finish()
}
