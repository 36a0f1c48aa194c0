//! Pydpiper core - a distributed pipeline scheduler for large
//! image-registration workloads.
//!
//! Users describe a computation as a DAG of external-command stages; this
//! crate schedules, dispatches, monitors, retries and records their
//! execution across a fleet of executors on a workstation or an SGE/PBS
//! cluster. The key components are:
//!
//! - [`dag::StageDag`]: the stage graph with its incrementally-maintained
//!   runnable frontier
//! - [`completion_log::CompletionLog`]: the append-only finished-stages
//!   record that makes restarts idempotent
//! - [`pipeline::Pipeline`]: the coordinator matching runnable stages to
//!   executor resource offers
//! - [`server`]: the gRPC bridge executors talk to
//! - [`executor`]: the agent that runs stage commands and reports back

pub mod completion_log;
pub mod config;
pub mod dag;
pub mod executor;
pub mod fingerprint;
pub mod logging;
pub mod messages;
pub mod pipeline;
pub mod server;
pub mod stage;
pub mod submit;

pub use config::{ExecutorOptions, QueueType, ServerOptions};
pub use dag::{DagError, StageDag};
pub use executor::{run_executor, ExecutorSummary};
pub use fingerprint::Fingerprint;
pub use messages::proto;
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, StatusSnapshot, WorkReply};
pub use server::{run_server, ExecutorBridgeService};
pub use stage::{
    CompletionAction, MemoryEstimate, PipelineSpec, RunnableAction, Stage, StageId, StageSpec,
    StageStatus,
};
