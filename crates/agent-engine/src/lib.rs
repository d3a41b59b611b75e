#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process runtime for the hpcq compute agent: queue client, job
//! execution, heartbeat emitter, and the lease loop.

/// Public API for the agent engine crate.
pub mod api;

mod decode;
mod engine;
mod executor;
mod heartbeat;
mod outcomes;
mod queue;
mod repos;
mod runtime;
mod stage;

pub use api::{
    start_agent, start_agent_with_transport, AgentEvent, AgentExit, AgentHandle, CommandRuntime,
    DecodeError, ExecMode, ExecutionRecord, Executor, HeartbeatEvent, Invocation, JobDescriptor,
    JobInput, JobOutcome, JobStatus, LeaseDisposition, LeasedMessage, ProcessRuntime, QueueClient,
    QueueTransport, ResultEvent, SyncedRepo, decode_message_body, DEFAULT_BATCH,
    HEARTBEAT_STALE_SECS, UNKNOWN_JOB_ID,
};
