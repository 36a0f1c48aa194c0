//! Command-line and environment configuration.
//!
//! Every option also reads a `PYDPIPER_*` environment variable, and a site
//! defaults file named by `PYDPIPER_CONFIG_FILE` (plain `key=value` lines)
//! is loaded into the environment before argument parsing, so the
//! precedence is: command line, then process environment, then site file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::warn;

/// Which substrate hosts the executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueType {
    /// Executors are plain child processes on this host.
    Local,
    /// Executors are submitted with SGE/OGS qsub.
    Sge,
    /// Executors are submitted with PBS/Torque qsub.
    Pbs,
}

/// Load the site defaults file named by `PYDPIPER_CONFIG_FILE`, if any,
/// into the process environment. Call before parsing options.
pub fn load_site_defaults() {
    if let Ok(path) = std::env::var("PYDPIPER_CONFIG_FILE") {
        if let Err(err) = dotenvy::from_path(&path) {
            warn!(path = %path, error = %err, "could not load config file");
        }
    }
}

/// Options for the pipeline server.
#[derive(Parser, Debug, Clone)]
#[command(name = "pipeline-server", about = "Distributed pipeline scheduler server")]
pub struct ServerOptions {
    /// Name prefixing the uri file, log directory and completion log.
    #[arg(long, env = "PYDPIPER_PIPELINE_NAME", default_value = "pipeline")]
    pub pipeline_name: String,

    /// Working directory for logs, backups and the uri file.
    #[arg(long, env = "PYDPIPER_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// JSON pipeline description (stages plus dependency edges).
    #[arg(long, env = "PYDPIPER_STAGES")]
    pub stages: Option<PathBuf>,

    /// Address to bind the bridge on; port 0 picks an ephemeral port.
    #[arg(long, env = "PYDPIPER_SERVER_ADDR", default_value = "127.0.0.1:0")]
    pub server_addr: String,

    /// Maximum memory (GB) any single executor may claim.
    #[arg(long, env = "PYDPIPER_MEM", default_value_t = 6.0)]
    pub mem: f64,

    /// Default memory estimate (GB) for stages that declare none.
    #[arg(long, env = "PYDPIPER_DEFAULT_JOB_MEM", default_value_t = 1.75)]
    pub default_job_mem: f64,

    /// Cores per executor.
    #[arg(long = "proc", env = "PYDPIPER_PROC", default_value_t = num_cpus::get() as u32)]
    pub procs: u32,

    /// Executors the server launches and maintains itself (0 = none; the
    /// operator starts executors by hand).
    #[arg(long, env = "PYDPIPER_NUM_EXECUTORS", default_value_t = 0)]
    pub num_executors: u32,

    #[arg(long, value_enum, env = "PYDPIPER_QUEUE_TYPE", default_value_t = QueueType::Local)]
    pub queue_type: QueueType,

    /// Batch-system memory resource name (e.g. vmem on some sites).
    #[arg(long, env = "PYDPIPER_MEM_REQUEST_VARIABLE", default_value = "mem")]
    pub mem_request_variable: String,

    /// SGE parallel environment for multi-core executors.
    #[arg(long, env = "PYDPIPER_PE")]
    pub pe: Option<String>,

    /// Executors run one stage at a time using their full memory allotment.
    #[arg(long, env = "PYDPIPER_GREEDY")]
    pub greedy: bool,

    /// Minutes of heartbeat silence tolerated before an executor is
    /// declared lost.
    #[arg(long, env = "PYDPIPER_LATENCY_TOLERANCE", default_value_t = 10.0)]
    pub latency_tolerance: f64,

    /// Minutes an executor launched alongside the server waits before
    /// first contact (batch substrates may start it before the server).
    #[arg(long, env = "PYDPIPER_EXECUTOR_START_DELAY", default_value_t = 10.0)]
    pub executor_start_delay: f64,

    /// Lost executors tolerated before the server stops launching and,
    /// with none left, shuts down.
    #[arg(long, env = "PYDPIPER_MAX_FAILED_EXECUTORS", default_value_t = 10)]
    pub max_failed_executors: u32,

    /// Maximum image pairs for LSQ12 registration (passed through to the
    /// domain stage builders).
    #[arg(long, env = "PYDPIPER_LSQ12_MAX_PAIRS", default_value_t = 25)]
    pub lsq12_max_pairs: u32,

    /// Where to write the server address; defaults to
    /// `<output_dir>/<pipeline_name>_uri`.
    #[arg(long, env = "PYDPIPER_URIFILE")]
    pub urifile: Option<PathBuf>,

    /// Skip the completed-stages scan and re-run everything.
    #[arg(long)]
    pub no_restart: bool,

    #[arg(long, short)]
    pub verbose: bool,
}

impl ServerOptions {
    pub fn latency_tolerance(&self) -> Duration {
        Duration::from_secs_f64(self.latency_tolerance * 60.0)
    }

    pub fn executor_start_delay(&self) -> Duration {
        Duration::from_secs_f64(self.executor_start_delay * 60.0)
    }

    pub fn uri_file(&self) -> PathBuf {
        self.urifile
            .clone()
            .unwrap_or_else(|| self.output_dir.join(format!("{}_uri", self.pipeline_name)))
    }

    /// Per-stage log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_logs", self.pipeline_name))
    }

    /// Verification manifest written by completion actions.
    pub fn verification_manifest(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_verification", self.pipeline_name))
            .join("manifest.txt")
    }

    /// Server log file used on PBS substrates, where stdout is not
    /// otherwise captured per-job.
    pub fn server_log_file(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_server_stdout.log", self.pipeline_name))
    }
}

/// Options for a single executor agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "pipeline-executor", about = "Pipeline stage executor agent")]
pub struct ExecutorOptions {
    /// File containing the server address, as written by the server.
    #[arg(long, env = "PYDPIPER_URIFILE")]
    pub uri_file: Option<PathBuf>,

    /// Server address, overriding the uri file.
    #[arg(long, env = "PYDPIPER_SERVER_ADDR")]
    pub server_addr: Option<String>,

    #[arg(long, env = "PYDPIPER_PIPELINE_NAME", default_value = "pipeline")]
    pub pipeline_name: String,

    #[arg(long, env = "PYDPIPER_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Total memory (GB) this executor offers.
    #[arg(long, env = "PYDPIPER_MEM", default_value_t = 6.0)]
    pub mem: f64,

    /// Stages run concurrently, one core each by default.
    #[arg(long = "proc", env = "PYDPIPER_PROC", default_value_t = num_cpus::get() as u32)]
    pub procs: u32,

    /// Run a single stage at a time using the full memory allotment.
    #[arg(long, env = "PYDPIPER_GREEDY")]
    pub greedy: bool,

    /// Seconds without work before the executor drains and exits.
    #[arg(long, env = "PYDPIPER_IDLE_TIMEOUT", default_value_t = 600)]
    pub idle_timeout: u64,

    /// Seconds between heartbeats.
    #[arg(long, env = "PYDPIPER_HEARTBEAT_INTERVAL", default_value_t = 60)]
    pub heartbeat_interval: u64,

    /// Seconds to wait before first contacting the server (batch startup
    /// staggering).
    #[arg(long, env = "PYDPIPER_START_DELAY", default_value_t = 0)]
    pub start_delay: u64,

    /// Walltime budget in seconds; the executor drains proactively as it
    /// runs out rather than being killed mid-stage.
    #[arg(long, env = "PYDPIPER_LIFETIME")]
    pub lifetime: Option<u64>,

    #[arg(long, short)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let opts = ServerOptions::parse_from(["pipeline-server"]);
        assert_eq!(opts.pipeline_name, "pipeline");
        assert_eq!(opts.mem, 6.0);
        assert_eq!(opts.default_job_mem, 1.75);
        assert_eq!(opts.mem_request_variable, "mem");
        assert_eq!(opts.latency_tolerance(), Duration::from_secs(600));
        assert_eq!(opts.executor_start_delay(), Duration::from_secs(600));
        assert_eq!(opts.queue_type, QueueType::Local);
        assert_eq!(opts.lsq12_max_pairs, 25);
        assert!(!opts.no_restart);
    }

    #[test]
    fn server_paths_are_pipeline_prefixed() {
        let opts = ServerOptions::parse_from([
            "pipeline-server",
            "--pipeline-name",
            "mbm_run",
            "--output-dir",
            "/scratch/run1",
        ]);
        assert_eq!(opts.uri_file(), PathBuf::from("/scratch/run1/mbm_run_uri"));
        assert_eq!(opts.log_dir(), PathBuf::from("/scratch/run1/mbm_run_logs"));
        assert_eq!(
            opts.server_log_file(),
            PathBuf::from("/scratch/run1/mbm_run_server_stdout.log")
        );
    }

    #[test]
    fn executor_defaults() {
        let opts = ExecutorOptions::parse_from(["pipeline-executor"]);
        assert_eq!(opts.idle_timeout, 600);
        assert_eq!(opts.heartbeat_interval, 60);
        assert_eq!(opts.start_delay, 0);
        assert!(opts.lifetime.is_none());
        assert!(!opts.greedy);
    }

    #[test]
    fn mem_request_variable_override() {
        let opts = ServerOptions::parse_from([
            "pipeline-server",
            "--queue-type",
            "pbs",
            "--mem-request-variable",
            "vmem",
        ]);
        assert_eq!(opts.queue_type, QueueType::Pbs);
        assert_eq!(opts.mem_request_variable, "vmem");
    }
}
