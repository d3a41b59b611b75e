use std::collections::BTreeMap;
use std::path::PathBuf;

/// Name of the drain sentinel file inside the state directory. Creating it
/// asks the running agent to stop pulling, finish in-flight work, and exit so
/// the supervisor respawns it with fresh code.
pub const RELOAD_SENTINEL: &str = "reload.requested";

/// Pid file written for the agent process.
pub const AGENT_PID_FILE: &str = "hpcq-agent.pid";

/// Pid file written for the supervisor process.
pub const SUPERVISOR_PID_FILE: &str = "hpcq-supervisor.pid";

/// Default HTTP base for the hosted queue API.
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Immutable agent configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Queue API base URL (no trailing path).
    pub api_base: String,
    /// Account owning the queues.
    pub account_id: String,
    /// Queue the agent leases job messages from.
    pub jobs_queue_id: String,
    /// Queue the agent publishes result and heartbeat events to.
    pub results_queue_id: String,
    /// Bearer credential for queue authentication.
    pub api_token: String,
    /// Maximum messages requested per pull.
    pub batch_size: u32,
    /// Lease duration granted on pull, in milliseconds.
    pub visibility_timeout_ms: u32,
    /// Base polling cadence in seconds.
    pub poll_interval_seconds: f64,
    /// Delay applied to retried messages, in seconds.
    pub retry_delay_seconds: u32,
    /// Deliveries after which a failing message is acked with a synthesised
    /// failure instead of retried again.
    pub max_retry_attempts: u32,
    /// Heartbeat cadence in seconds (lower-bounded at 1s by the emitter).
    pub heartbeat_interval_seconds: f64,
    /// Root directory for per-job artifact directories.
    pub results_dir: PathBuf,
    /// Root directory for pid files and the reload sentinel.
    pub state_dir: PathBuf,
    /// Container runtime executable.
    pub container_bin: String,
    /// Container image path.
    pub container_image: PathBuf,
    /// Command run inside the container via `/bin/bash -lc`.
    pub container_cmd: String,
    /// Extra bind mount passed through to the container runtime, if any.
    pub container_extra_bind: Option<String>,
    /// External image-refresh helper; `None` skips the refresh step.
    pub image_refresh_cmd: Option<PathBuf>,
    /// Root under which external repositories are synced.
    pub external_repos_root: PathBuf,
    /// External source trees synced before container execution.
    pub external_repos: Vec<RepoSpec>,
}

impl Config {
    /// Messages endpoint base for the jobs queue.
    pub fn jobs_api_base(&self) -> String {
        self.queue_messages_base(&self.jobs_queue_id)
    }

    /// Messages endpoint base for the results queue.
    pub fn results_api_base(&self) -> String {
        self.queue_messages_base(&self.results_queue_id)
    }

    fn queue_messages_base(&self, queue_id: &str) -> String {
        format!(
            "{}/accounts/{}/queues/{}/messages",
            self.api_base.trim_end_matches('/'),
            self.account_id,
            queue_id
        )
    }

    /// Path of the drain sentinel watched by the lease loop.
    pub fn drain_sentinel_path(&self) -> PathBuf {
        self.state_dir.join(RELOAD_SENTINEL)
    }
}

/// One external source tree pinned to a ref, synced under the repos root and
/// bind-mounted into container jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    /// Repo name; also the directory name and the container mount point.
    pub name: String,
    /// Remote URL.
    pub url: String,
    /// Ref fetched and hard-reset to on every sync.
    pub gitref: String,
}

/// Collect repo specs from `<NAME>_REPO_URL` / `<NAME>_REPO_REF` pairs in the
/// process environment.
pub fn repo_specs_from_env() -> Vec<RepoSpec> {
    repo_specs_from_vars(std::env::vars())
}

/// Environment-independent core of [`repo_specs_from_env`]. The ref defaults
/// to `main` when the companion `_REPO_REF` variable is absent or blank.
pub fn repo_specs_from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Vec<RepoSpec> {
    let vars: BTreeMap<String, String> = vars.into_iter().collect();

    let mut specs = Vec::new();
    for (key, url) in &vars {
        let Some(prefix) = key.strip_suffix("_REPO_URL") else {
            continue;
        };
        let url = url.trim();
        if prefix.is_empty() || url.is_empty() {
            continue;
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            continue;
        }

        let ref_key = format!("{prefix}_REPO_REF");
        let gitref = vars
            .get(&ref_key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("main");

        specs.push(RepoSpec {
            name: prefix.to_ascii_lowercase(),
            url: url.to_string(),
            gitref: gitref.to_string(),
        });
    }
    specs
}
