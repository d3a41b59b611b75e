use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hpcq_agent_core::config::{AGENT_PID_FILE, SUPERVISOR_PID_FILE};
use hpcq_agent_core::node::{remove_pid_file, write_pid_file};

#[derive(Debug, Parser)]
#[command(
    name = "hpcq-supervisor",
    version,
    about = "Keeps the hpcq agent running, restarting it on unexpected exit"
)]
struct Cli {
    /// Directory for pid files; shared with the agent's state dir.
    #[arg(long, env = "HPCQ_STATE_DIR", default_value = ".")]
    state_dir: PathBuf,

    /// Agent executable; defaults to `hpcq-agent` next to this binary.
    #[arg(long, env = "HPCQ_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Seconds to wait before respawning after an unexpected exit.
    #[arg(long, env = "HPCQ_RESTART_DELAY_SECONDS", default_value_t = 2.0)]
    restart_delay_seconds: f64,
}

fn default_agent_bin() -> anyhow::Result<PathBuf> {
    let me = std::env::current_exe().context("resolve supervisor executable")?;
    Ok(me.with_file_name("hpcq-agent"))
}

// Forward SIGTERM so the agent drains in-flight leases before exiting.
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let agent_bin = match cli.agent_bin.clone() {
        Some(path) => path,
        None => default_agent_bin()?,
    };

    let agent_pid_path = cli.state_dir.join(AGENT_PID_FILE);
    let supervisor_pid_path = cli.state_dir.join(SUPERVISOR_PID_FILE);
    write_pid_file(&supervisor_pid_path, std::process::id())?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        info!(agent = %agent_bin.display(), "starting agent");
        let mut child = Command::new(&agent_bin)
            .spawn()
            .with_context(|| format!("spawn {}", agent_bin.display()))?;
        if let Some(pid) = child.id() {
            write_pid_file(&agent_pid_path, pid)?;
        }

        let exited = tokio::select! {
            status = child.wait() => Some(status.context("wait for agent")?),
            _ = sigterm.recv() => None,
            _ = sigint.recv() => None,
        };

        match exited {
            Some(status) => {
                warn!(
                    %status,
                    "agent exited; restarting in {:.1}s",
                    cli.restart_delay_seconds
                );
                let stop = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(cli.restart_delay_seconds)) => false,
                    _ = sigterm.recv() => true,
                    _ = sigint.recv() => true,
                };
                if stop {
                    break;
                }
            }
            None => {
                info!("termination signal received; stopping agent");
                terminate(&child);
                let _ = child.wait().await;
                break;
            }
        }
    }

    remove_pid_file(&agent_pid_path);
    remove_pid_file(&supervisor_pid_path);
    Ok(())
}
