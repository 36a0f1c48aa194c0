//! Generated wire-protocol types for the executor bridge.
//!
//! The protocol definition lives in `proto/executor.proto`; `build.rs`
//! compiles it with tonic-build. Everything the server and the executor
//! exchange goes through these types.

/// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("pydpiper.executor");
}

use proto::{StageAssignment, WorkDirective, WorkResponse};

/// Build a `WorkResponse` carrying a stage to run.
pub fn run_stage_response(stage: StageAssignment) -> WorkResponse {
    WorkResponse {
        directive: WorkDirective::RunStage as i32,
        stage: Some(stage),
    }
}

/// Build a `WorkResponse` asking the executor to poll again later.
pub fn wait_response() -> WorkResponse {
    WorkResponse {
        directive: WorkDirective::Wait as i32,
        stage: None,
    }
}

/// Build a `WorkResponse` telling the executor to drain and exit.
pub fn shutdown_response() -> WorkResponse {
    WorkResponse {
        directive: WorkDirective::Shutdown as i32,
        stage: None,
    }
}
