use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use hpcq_agent_core::config::Config;

use crate::api::{ExecMode, ExecutionRecord, JobDescriptor, JobStatus, SyncedRepo};
use crate::runtime::{CommandRuntime, Invocation};
use crate::{repos, stage};

const TAIL_BYTES: usize = 8192;
const DEFAULT_COMMAND: &str = "echo no command provided";

struct JobPaths {
    job_dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
    meta: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    runtime_stdout: PathBuf,
    runtime_stderr: PathBuf,
}

impl JobPaths {
    fn new(job_dir: &Path) -> Self {
        Self {
            job_dir: job_dir.to_path_buf(),
            input: job_dir.join("input.json"),
            output: job_dir.join("output.json"),
            meta: job_dir.join("meta.json"),
            stdout: job_dir.join("stdout.log"),
            stderr: job_dir.join("stderr.log"),
            runtime_stdout: job_dir.join("apptainer.stdout.log"),
            runtime_stderr: job_dir.join("apptainer.stderr.log"),
        }
    }
}

/// Runs one job attempt inside its per-job directory under the configured
/// results root.
pub struct Executor {
    config: Arc<Config>,
    runtime: Arc<dyn CommandRuntime>,
    sync_lock: Arc<Mutex<()>>,
}

impl Executor {
    /// Build an executor. `sync_lock` is the process-wide lock serialising
    /// repo sync with image refresh.
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn CommandRuntime>,
        sync_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            config,
            runtime,
            sync_lock,
        }
    }

    /// Provision the job directory, stage inputs, run the job, and write its
    /// records.
    ///
    /// A non-zero child exit is not an error: it yields a `failed` record.
    /// Failures before the child runs (bad staged paths, repo sync, spawn)
    /// are errors and leave no record behind.
    pub async fn execute(&self, descriptor: &JobDescriptor) -> anyhow::Result<ExecutionRecord> {
        let job_dir = self.config.results_dir.join(&descriptor.job_id);
        tokio::fs::create_dir_all(&job_dir)
            .await
            .with_context(|| format!("create job directory {}", job_dir.display()))?;
        let job_dir = tokio::fs::canonicalize(&job_dir)
            .await
            .with_context(|| format!("canonicalize job directory {}", job_dir.display()))?;
        let paths = JobPaths::new(&job_dir);

        let input_doc = json!({"job_id": descriptor.job_id, "input": descriptor.raw_input});
        write_json(&paths.input, &input_doc, false).await?;

        let staged_files =
            stage::stage_local_files(&descriptor.input.local_files, &job_dir).await?;

        match descriptor.input.exec_mode {
            ExecMode::Container => self.execute_container(descriptor, &paths, staged_files).await,
            ExecMode::Host => self.execute_host(descriptor, &paths, staged_files).await,
        }
    }

    async fn execute_container(
        &self,
        descriptor: &JobDescriptor,
        paths: &JobPaths,
        staged_files: Vec<String>,
    ) -> anyhow::Result<ExecutionRecord> {
        let synced_repos = {
            let _guard = self.sync_lock.lock().await;
            repos::sync_external_repos(&self.config).await?
        };

        // A redelivered job id reuses this directory; truncate the logs and
        // drop any prior output.json so the record reflects this attempt
        // only. The in-container entrypoint rewrites these via the /work
        // bind, and the truncated logs keep the directory complete even when
        // it does not.
        for path in [&paths.stdout, &paths.stderr] {
            tokio::fs::write(path, b"")
                .await
                .with_context(|| format!("create {}", path.display()))?;
        }
        if paths.output.exists() {
            tokio::fs::remove_file(&paths.output)
                .await
                .with_context(|| format!("remove {}", paths.output.display()))?;
        }

        let invocation = Invocation {
            argv: container_argv(&self.config, &paths.job_dir, &synced_repos),
            cwd: None,
            stdout_path: paths.runtime_stdout.clone(),
            stderr_path: paths.runtime_stderr.clone(),
        };

        let started_at = now_rfc3339();
        let exit_code = self.runtime.run(&invocation).await?;
        let finished_at = now_rfc3339();
        let status = status_of(exit_code);

        if !paths.output.exists() {
            let placeholder = json!({
                "job_id": descriptor.job_id,
                "status": status,
                "started_at": started_at,
                "finished_at": finished_at,
                "exit_code": exit_code,
                "result": {"note": "container produced no output.json"},
            });
            write_json(&paths.output, &placeholder, true).await?;
        }

        self.finish(
            descriptor,
            paths,
            staged_files,
            synced_repos,
            descriptor.input.workdir.clone(),
            status,
            started_at,
            finished_at,
            exit_code,
        )
        .await
    }

    async fn execute_host(
        &self,
        descriptor: &JobDescriptor,
        paths: &JobPaths,
        staged_files: Vec<String>,
    ) -> anyhow::Result<ExecutionRecord> {
        let command = effective_command(descriptor);
        let invocation = Invocation {
            argv: vec![
                "/bin/bash".to_string(),
                "-lc".to_string(),
                command.clone(),
            ],
            cwd: Some(paths.job_dir.clone()),
            stdout_path: paths.stdout.clone(),
            stderr_path: paths.stderr.clone(),
        };

        let started_at = now_rfc3339();
        let exit_code = self.runtime.run(&invocation).await?;
        let finished_at = now_rfc3339();
        let status = status_of(exit_code);

        let envelope = json!({
            "job_id": descriptor.job_id,
            "exec_mode": ExecMode::Host,
            "command": command,
            "status": status,
            "started_at": started_at,
            "finished_at": finished_at,
            "exit_code": exit_code,
            "result": {
                "stdout_path": paths.stdout.display().to_string(),
                "stderr_path": paths.stderr.display().to_string(),
            },
        });
        write_json(&paths.output, &envelope, true).await?;

        self.finish(
            descriptor,
            paths,
            staged_files,
            Vec::new(),
            Some(paths.job_dir.display().to_string()),
            status,
            started_at,
            finished_at,
            exit_code,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        descriptor: &JobDescriptor,
        paths: &JobPaths,
        staged_files: Vec<String>,
        synced_repos: Vec<SyncedRepo>,
        workdir: Option<String>,
        status: JobStatus,
        started_at: String,
        finished_at: String,
        exit_code: i32,
    ) -> anyhow::Result<ExecutionRecord> {
        let record = ExecutionRecord {
            job_id: descriptor.job_id.clone(),
            exec_mode: descriptor.input.exec_mode,
            command: effective_command(descriptor),
            workdir,
            status,
            started_at,
            finished_at,
            exit_code,
            stdout_tail: tail_text(&paths.stdout).await,
            stderr_tail: tail_text(&paths.stderr).await,
            staged_files,
            synced_repos,
            stdout_path: paths.stdout.display().to_string(),
            stderr_path: paths.stderr.display().to_string(),
            input_path: paths.input.display().to_string(),
            output_path: paths.output.display().to_string(),
            meta_path: paths.meta.display().to_string(),
        };

        let meta = serde_json::to_value(&record).context("serialize execution record")?;
        write_json(&paths.meta, &meta, true).await?;
        Ok(record)
    }
}

/// Invoke the external image-refresh helper, when configured. Callers hold
/// the process-wide sync lock. A failing or unspawnable helper fails the job
/// attempt.
pub(crate) async fn ensure_image_fresh(config: &Config) -> anyhow::Result<()> {
    let Some(cmd) = &config.image_refresh_cmd else {
        return Ok(());
    };
    let status = tokio::process::Command::new(cmd)
        .current_dir(&config.state_dir)
        .status()
        .await
        .with_context(|| format!("spawn image refresh helper {}", cmd.display()))?;
    if !status.success() {
        anyhow::bail!("image refresh helper {} failed: {status}", cmd.display());
    }
    Ok(())
}

fn container_argv(config: &Config, job_dir: &Path, synced_repos: &[SyncedRepo]) -> Vec<String> {
    let mut argv = vec![
        config.container_bin.clone(),
        "exec".to_string(),
        "--bind".to_string(),
        format!("{}:/work", job_dir.display()),
        "--bind".to_string(),
        "/:/portal:ro".to_string(),
    ];
    if let Some(extra) = &config.container_extra_bind {
        argv.push("--bind".to_string());
        argv.push(extra.clone());
    }
    for repo in synced_repos {
        argv.push("--bind".to_string());
        argv.push(format!("{}:/{}", repo.path, repo.name));
    }
    argv.push(config.container_image.display().to_string());
    argv.push("/bin/bash".to_string());
    argv.push("-lc".to_string());
    argv.push(config.container_cmd.clone());
    argv
}

fn effective_command(descriptor: &JobDescriptor) -> String {
    descriptor
        .input
        .command
        .clone()
        .unwrap_or_else(|| DEFAULT_COMMAND.to_string())
}

fn status_of(exit_code: i32) -> JobStatus {
    if exit_code == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn write_json(path: &Path, value: &serde_json::Value, pretty: bool) -> anyhow::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("serialize json document")?;
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("write {}", path.display()))
}

// Last TAIL_BYTES of a log, lossy-decoded; unreadable files yield "".
async fn tail_text(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}
