use std::path::PathBuf;

use clap::Parser;

use hpcq_agent_core::config::{repo_specs_from_env, Config, DEFAULT_API_BASE};
use hpcq_agent_engine::DEFAULT_BATCH;

#[derive(Debug, Clone, Parser)]
#[command(name = "hpcq-agent", version, about = "hpcq node-side compute agent")]
pub struct Cli {
    /// Bearer credential for queue authentication.
    #[arg(long, env = "HPCQ_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    #[arg(long, env = "HPCQ_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    #[arg(long, env = "HPCQ_ACCOUNT_ID")]
    pub account_id: String,

    /// Queue the agent leases job messages from.
    #[arg(long, env = "HPCQ_JOBS_QUEUE_ID")]
    pub jobs_queue_id: String,

    /// Queue the agent publishes result and heartbeat events to.
    #[arg(long, env = "HPCQ_RESULTS_QUEUE_ID")]
    pub results_queue_id: String,

    /// Maximum messages requested per pull.
    #[arg(long, env = "HPCQ_BATCH_SIZE", default_value_t = DEFAULT_BATCH)]
    pub batch_size: u32,

    /// Lease duration granted on pull, in milliseconds.
    #[arg(long, env = "HPCQ_VISIBILITY_TIMEOUT_MS", default_value_t = 120_000)]
    pub visibility_timeout_ms: u32,

    /// Base polling cadence in seconds.
    #[arg(long, env = "HPCQ_POLL_INTERVAL_SECONDS", default_value_t = 2.0)]
    pub poll_interval_seconds: f64,

    /// Delay applied to retried messages, in seconds.
    #[arg(long, env = "HPCQ_RETRY_DELAY_SECONDS", default_value_t = 30)]
    pub retry_delay_seconds: u32,

    /// Deliveries after which a failing message is acked with a synthesised
    /// failure instead of retried again.
    #[arg(long, env = "HPCQ_MAX_RETRY_ATTEMPTS", default_value_t = 5)]
    pub max_retry_attempts: u32,

    /// Heartbeat cadence in seconds.
    #[arg(long, env = "HPCQ_HEARTBEAT_INTERVAL_SECONDS", default_value_t = 600.0)]
    pub heartbeat_interval_seconds: f64,

    /// Root for per-job artifact directories.
    #[arg(long, env = "HPCQ_RESULTS_DIR", default_value = "results")]
    pub results_dir: PathBuf,

    /// Root for pid files, the reload sentinel, and the default repos root.
    #[arg(long, env = "HPCQ_STATE_DIR", default_value = ".")]
    pub state_dir: PathBuf,

    /// Container runtime executable.
    #[arg(long, env = "HPCQ_CONTAINER_BIN", default_value = "apptainer")]
    pub container_bin: String,

    /// Container image path.
    #[arg(long, env = "HPCQ_CONTAINER_IMAGE", default_value = "runtime/hpcq-runtime.sif")]
    pub container_image: PathBuf,

    /// Command run inside the container via `/bin/bash -lc`.
    #[arg(long, env = "HPCQ_CONTAINER_CMD", default_value = "python /app/run.py")]
    pub container_cmd: String,

    /// Extra bind mount passed through to the container runtime
    /// (`src:dst[:opts]`).
    #[arg(long, env = "HPCQ_CONTAINER_EXTRA_BIND")]
    pub container_extra_bind: Option<String>,

    /// Image refresh helper run before container jobs; unset skips the step.
    #[arg(long, env = "HPCQ_IMAGE_REFRESH_CMD")]
    pub image_refresh_cmd: Option<PathBuf>,

    /// Root under which external repositories are synced
    /// (default: `<state-dir>/repos`).
    #[arg(long, env = "HPCQ_EXTERNAL_REPOS_ROOT")]
    pub external_repos_root: Option<PathBuf>,
}

impl Cli {
    /// Resolve the full agent configuration, picking up
    /// `<NAME>_REPO_URL`/`<NAME>_REPO_REF` pairs from the environment.
    pub fn into_config(self) -> Config {
        let external_repos_root = self
            .external_repos_root
            .unwrap_or_else(|| self.state_dir.join("repos"));

        Config {
            api_base: self.api_base,
            account_id: self.account_id,
            jobs_queue_id: self.jobs_queue_id,
            results_queue_id: self.results_queue_id,
            api_token: self.api_token,
            batch_size: self.batch_size,
            visibility_timeout_ms: self.visibility_timeout_ms,
            poll_interval_seconds: self.poll_interval_seconds,
            retry_delay_seconds: self.retry_delay_seconds,
            max_retry_attempts: self.max_retry_attempts,
            heartbeat_interval_seconds: self.heartbeat_interval_seconds,
            results_dir: self.results_dir,
            state_dir: self.state_dir,
            container_bin: self.container_bin,
            container_image: self.container_image,
            container_cmd: self.container_cmd,
            container_extra_bind: self.container_extra_bind,
            image_refresh_cmd: self.image_refresh_cmd,
            external_repos_root,
            external_repos: repo_specs_from_env(),
        }
    }
}
