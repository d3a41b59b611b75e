mod cli;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hpcq_agent_engine::{start_agent, AgentEvent, AgentExit};

use crate::cli::Cli;

/// Non-zero exit after a drain so the supervisor respawns with fresh code.
const DRAIN_EXIT_CODE: i32 = 3;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn spawn_signal_handlers(shutdown_tx: mpsc::UnboundedSender<&'static str>) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let term_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            let _ = term_tx.send("SIGTERM");
        }
    });

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let _ = shutdown_tx.send("SIGINT");
        }
    });

    Ok(())
}

// Returns true once the agent reports Stopped.
fn log_event(event: AgentEvent) -> bool {
    match event {
        AgentEvent::Started => info!("agent started"),
        AgentEvent::StopRequested => info!("stop requested; finishing in-flight leases"),
        AgentEvent::Draining => warn!("reload sentinel present; draining before exit"),
        AgentEvent::JobStarted { job_id, exec_mode } => {
            info!(%job_id, ?exec_mode, "job started");
        }
        AgentEvent::JobFinished { outcome } => {
            info!(
                job_id = %outcome.job_id,
                status = ?outcome.status,
                disposition = ?outcome.disposition,
                error = outcome.error.as_deref(),
                elapsed_ms = outcome.elapsed_ms,
                "job finished"
            );
        }
        AgentEvent::Warning { message } => warn!("{message}"),
        AgentEvent::Error { message } => error!("{message}"),
        AgentEvent::Stopped => {
            info!("agent stopped");
            return true;
        }
    }
    false
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.into_config();
    info!(
        jobs_queue_id = %config.jobs_queue_id,
        results_queue_id = %config.results_queue_id,
        batch_size = config.batch_size,
        visibility_timeout_ms = config.visibility_timeout_ms,
        poll_interval_seconds = config.poll_interval_seconds,
        external_repos = config.external_repos.len(),
        "starting hpcq agent {}",
        env!("CARGO_PKG_VERSION")
    );

    let handle = start_agent(config);
    let mut events = handle.subscribe();

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<&'static str>();
    spawn_signal_handlers(shutdown_tx)?;

    loop {
        tokio::select! {
            sig = shutdown_rx.recv() => {
                if let Some(sig) = sig {
                    warn!("received {sig}; draining in-flight work before exit");
                    handle.request_stop();
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if log_event(event) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event stream lagged; {skipped} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    match handle.wait().await? {
        AgentExit::Drained => {
            info!("drain complete; exiting for supervisor respawn");
            std::process::exit(DRAIN_EXIT_CODE);
        }
        AgentExit::Terminated => Ok(()),
    }
}
