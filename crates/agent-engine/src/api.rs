//! Public types for the hpcq agent engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hpcq_agent_core::config::Config;

pub use crate::decode::{decode_message_body, DecodeError};
pub use crate::executor::Executor;
pub use crate::heartbeat::HeartbeatEvent;
pub use crate::queue::{LeasedMessage, QueueClient, QueueTransport};
pub use crate::runtime::{CommandRuntime, Invocation, ProcessRuntime};

/// Job id used for messages that carry none.
pub const UNKNOWN_JOB_ID: &str = "unknown";

/// Maximum messages requested per pull when none is configured.
pub const DEFAULT_BATCH: u32 = 100;

/// Observers should treat the agent as unhealthy once its newest heartbeat is
/// older than this many seconds.
pub const HEARTBEAT_STALE_SECS: u64 = 90;

/// Where a job attempt runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Inside the container runtime with the job directory bound at `/work`.
    #[default]
    Container,
    /// Directly on the host shell with the job directory as cwd.
    Host,
}

/// Terminal status of a job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Child exited zero.
    Completed,
    /// Child exited non-zero, or the attempt failed before the child ran.
    Failed,
}

/// A decoded job message.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Job identifier; [`UNKNOWN_JOB_ID`] when the message carries none.
    pub job_id: String,
    /// Typed view of the job payload.
    pub input: JobInput,
    /// The payload object exactly as received; persisted verbatim into
    /// `input.json` so in-container consumers see fields the agent ignores.
    pub raw_input: Value,
}

/// Typed fields of a job payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    /// Shell command to run.
    #[serde(default)]
    pub command: Option<String>,
    /// Requested execution mode; anything other than `host` (case-insensitive)
    /// selects the container path.
    #[serde(default, deserialize_with = "crate::decode::de_exec_mode")]
    pub exec_mode: ExecMode,
    /// Working directory hint for the in-container entrypoint.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Raw `local_files` entries, interpreted and validated at staging time.
    /// A non-list value is treated as empty.
    #[serde(default, deserialize_with = "crate::decode::de_local_files")]
    pub local_files: Vec<Value>,
}

/// One synced external repository recorded in an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedRepo {
    /// Repo name (directory and container mount point).
    pub name: String,
    /// Absolute checkout path on the host.
    pub path: String,
    /// Ref the checkout was reset to.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Resolved commit id.
    pub commit: String,
}

/// Structured summary of one job attempt, persisted as `meta.json` and
/// partially embedded in the published result event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Job identifier.
    pub job_id: String,
    /// Mode the attempt ran in.
    pub exec_mode: ExecMode,
    /// Effective shell command.
    pub command: String,
    /// Working directory: the job directory in host mode, the descriptor's
    /// `workdir` hint in container mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Terminal status derived from the child exit code.
    pub status: JobStatus,
    /// RFC-3339 UTC timestamp taken just before the child started.
    pub started_at: String,
    /// RFC-3339 UTC timestamp taken just after the child finished.
    pub finished_at: String,
    /// Child exit code (-1 when terminated by a signal).
    pub exit_code: i32,
    /// Tail of the job's stdout log.
    pub stdout_tail: String,
    /// Tail of the job's stderr log.
    pub stderr_tail: String,
    /// Absolute paths of files staged from the descriptor.
    #[serde(default)]
    pub staged_files: Vec<String>,
    /// External repositories synced for this attempt.
    #[serde(default)]
    pub synced_repos: Vec<SyncedRepo>,
    /// Absolute path of `stdout.log`.
    pub stdout_path: String,
    /// Absolute path of `stderr.log`.
    pub stderr_path: String,
    /// Absolute path of `input.json`.
    pub input_path: String,
    /// Absolute path of the canonical `output.json`.
    pub output_path: String,
    /// Absolute path of `meta.json`.
    pub meta_path: String,
}

/// Event published to the results queue for a terminal job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Job identifier.
    pub job_id: String,
    /// Terminal status.
    pub status: JobStatus,
    /// Absolute path to the canonical `output.json`; absent only for
    /// synthesised failures with no job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_pointer: Option<String>,
    /// Event kind; mirrors `status` for terminal events.
    pub event_type: JobStatus,
    /// Mode the attempt ran (or would have run) in.
    pub exec_mode: ExecMode,
    /// Effective shell command, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Working directory, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Child exit code, when a child ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Tail of the job's stdout log.
    pub stdout_tail: String,
    /// Tail of the job's stderr log; the error text for synthesised failures.
    pub stderr_tail: String,
    /// Start timestamp, when a child ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Finish timestamp, when a child ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Queue delivery attempts observed for the handled lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ResultEvent {
    /// Build the terminal event for a finished execution.
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            status: record.status,
            result_pointer: Some(record.output_path.clone()),
            event_type: record.status,
            exec_mode: record.exec_mode,
            command: Some(record.command.clone()),
            workdir: record.workdir.clone(),
            exit_code: Some(record.exit_code),
            stdout_tail: record.stdout_tail.clone(),
            stderr_tail: record.stderr_tail.clone(),
            started_at: Some(record.started_at.clone()),
            finished_at: Some(record.finished_at.clone()),
            attempts: None,
        }
    }

    /// Build the event published when a message exhausts its retry budget
    /// without ever producing an execution record.
    pub fn synthesized_failure(
        job_id: &str,
        exec_mode: ExecMode,
        error: &str,
        attempts: u32,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            result_pointer: None,
            event_type: JobStatus::Failed,
            exec_mode,
            command: None,
            workdir: None,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: error.to_string(),
            started_at: None,
            finished_at: None,
            attempts: Some(attempts),
        }
    }
}

/// What the agent did with a lease after handling its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseDisposition {
    /// Terminal event published and an ack queued.
    Acked,
    /// A retry with the configured delay queued.
    Retried,
    /// Nothing queued; the lease expires and the queue redelivers.
    Abandoned,
}

/// Summary of one handled lease, carried by [`AgentEvent::JobFinished`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier ([`UNKNOWN_JOB_ID`] when undecodable).
    pub job_id: String,
    /// Terminal status, when a terminal event was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// Lease disposition.
    pub disposition: LeaseDisposition,
    /// Failure message, when the attempt failed before completing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time spent handling the message, in milliseconds.
    pub elapsed_ms: u64,
}

/// Agent event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Agent runtime started.
    Started,
    /// Graceful stop requested (signal observed).
    StopRequested,
    /// Reload sentinel observed; no new pulls until drained.
    Draining,
    /// A worker began executing a decoded job.
    JobStarted {
        /// Job identifier.
        job_id: String,
        /// Requested execution mode.
        exec_mode: ExecMode,
    },
    /// A worker finished handling a lease.
    JobFinished {
        /// Outcome summary.
        outcome: JobOutcome,
    },
    /// A non-fatal warning.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error.
    Error {
        /// Error message.
        message: String,
    },
    /// Agent runtime stopped.
    Stopped,
}

/// Why the agent runtime stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The reload sentinel was observed and in-flight work drained; the
    /// sentinel has been removed and the process should exit non-zero so the
    /// supervisor respawns it.
    Drained,
    /// A termination signal was observed and in-flight work drained.
    Terminated,
}

/// Handle to a running agent runtime.
pub struct AgentHandle {
    pub(crate) inner: Arc<crate::engine::AgentInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<AgentExit>>,
}

impl AgentHandle {
    /// Subscribe to the agent event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Request a graceful stop: finish in-flight leases, flush outcomes, exit.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the runtime to stop and return why it did.
    pub async fn wait(self) -> anyhow::Result<AgentExit> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("agent task join error: {err}")),
        }
    }
}

/// Start the agent runtime (lease loop plus heartbeat emitter) in the
/// background, talking to the remote queue over HTTP.
pub fn start_agent(config: Config) -> AgentHandle {
    crate::engine::start_agent(config)
}

/// Start the agent runtime against a caller-supplied [`QueueTransport`]
/// instead of the HTTP client. This is the test seam for the lease loop.
pub fn start_agent_with_transport(
    config: Config,
    queue: Arc<dyn QueueTransport>,
) -> AgentHandle {
    crate::engine::start_agent_with_transport(config, queue)
}
