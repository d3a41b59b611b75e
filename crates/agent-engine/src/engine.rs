use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinSet;

use hpcq_agent_core::config::Config;

use crate::api::{
    AgentEvent, AgentExit, AgentHandle, ExecMode, ExecutionRecord, JobDescriptor, JobOutcome,
    JobStatus, LeaseDisposition, ResultEvent, UNKNOWN_JOB_ID,
};
use crate::decode::decode_message_body;
use crate::executor::{ensure_image_fresh, Executor};
use crate::heartbeat;
use crate::outcomes::{LeaseOutcome, OutcomeBuffer};
use crate::queue::{LeasedMessage, QueueClient, QueueTransport};
use crate::runtime::{CommandRuntime, ProcessRuntime};

const MIN_SLEEP_SECS: f64 = 1.0;
const MAX_SLEEP_SECS: f64 = 30.0;
const MAX_IDLE_STREAK: u32 = 8;

pub(crate) struct AgentInner {
    pub(crate) event_tx: broadcast::Sender<AgentEvent>,
    stop_requested: AtomicBool,
    notify: Notify,
}

impl AgentInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(AgentEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn emit_warning(&self, message: String) {
        self.emit(AgentEvent::Warning { message });
    }

    pub(crate) fn emit_error(&self, message: String) {
        self.emit(AgentEvent::Error { message });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Polling,
    Draining,
    Terminating,
}

fn resolve_state(stop_requested: bool, sentinel_present: bool) -> LoopState {
    if stop_requested {
        LoopState::Terminating
    } else if sentinel_present {
        LoopState::Draining
    } else {
        LoopState::Polling
    }
}

// poll_interval * 2^idle_streak, clamped to [1, 30] seconds.
fn backoff_delay(poll_interval_seconds: f64, idle_streak: u32) -> Duration {
    let exp = idle_streak.min(MAX_IDLE_STREAK);
    let secs = poll_interval_seconds * (1u64 << exp) as f64;
    Duration::from_secs_f64(secs.clamp(MIN_SLEEP_SECS, MAX_SLEEP_SECS))
}

#[derive(Clone)]
struct WorkerContext {
    cfg: Arc<Config>,
    queue: Arc<dyn QueueTransport>,
    executor: Arc<Executor>,
    outcomes: Arc<OutcomeBuffer>,
    sync_lock: Arc<Mutex<()>>,
    inner: Arc<AgentInner>,
}

struct LeaseLoop {
    ctx: WorkerContext,
    workers: JoinSet<()>,
    idle_streak: u32,
    announced_drain: bool,
}

impl LeaseLoop {
    fn current_state(&mut self) -> LoopState {
        let state = resolve_state(
            self.ctx.inner.should_stop(),
            self.ctx.cfg.drain_sentinel_path().exists(),
        );
        match state {
            LoopState::Draining if !self.announced_drain => {
                self.announced_drain = true;
                self.ctx.inner.emit(AgentEvent::Draining);
            }
            LoopState::Polling => self.announced_drain = false,
            _ => {}
        }
        state
    }

    fn dispatch(&mut self, message: LeasedMessage) {
        // A message without a lease id can never be acked; skip it.
        let Some(lease_id) = message
            .lease_id
            .clone()
            .filter(|lease_id| !lease_id.is_empty())
        else {
            return;
        };

        let ctx = self.ctx.clone();
        self.workers.spawn(run_worker(ctx, lease_id, message));
    }

    async fn run(mut self) -> anyhow::Result<AgentExit> {
        self.ctx.inner.emit(AgentEvent::Started);

        loop {
            let mut did_work = false;

            // Reap finished workers.
            while let Some(res) = self.workers.try_join_next() {
                did_work = true;
                if let Err(err) = res {
                    if !err.is_cancelled() {
                        self.ctx
                            .inner
                            .emit_error(format!("worker task aborted: {err:#}"));
                    }
                }
            }

            // Flush queued outcomes in a single ack call.
            let (acks, retries) = self.ctx.outcomes.drain();
            if !acks.is_empty() || !retries.is_empty() {
                did_work = true;
                let (ack_count, retry_count) = (acks.len(), retries.len());
                if let Err(err) = self.ctx.queue.ack_batch(acks, retries).await {
                    // Not acked means the queue redelivers after the
                    // visibility timeout; nothing to unwind locally.
                    self.ctx.inner.emit_error(format!(
                        "ack batch failed ({ack_count} acks, {retry_count} retries): {err:#}"
                    ));
                }
            }

            let state = self.current_state();
            if state != LoopState::Polling
                && self.workers.is_empty()
                && self.ctx.outcomes.is_empty()
            {
                return Ok(match state {
                    LoopState::Draining => {
                        let sentinel = self.ctx.cfg.drain_sentinel_path();
                        if let Err(err) = std::fs::remove_file(&sentinel) {
                            self.ctx.inner.emit_warning(format!(
                                "failed to remove reload sentinel {}: {err}",
                                sentinel.display()
                            ));
                        }
                        AgentExit::Drained
                    }
                    _ => AgentExit::Terminated,
                });
            }

            if state == LoopState::Polling {
                match self
                    .ctx
                    .queue
                    .pull(self.ctx.cfg.batch_size, self.ctx.cfg.visibility_timeout_ms)
                    .await
                {
                    Ok(messages) => {
                        if !messages.is_empty() {
                            did_work = true;
                        }
                        for message in messages {
                            self.dispatch(message);
                        }
                    }
                    Err(err) => {
                        self.ctx.inner.emit_error(format!("pull failed: {err:#}"));
                    }
                }
            }

            let idle = !did_work && self.workers.is_empty();
            if idle {
                self.idle_streak = (self.idle_streak + 1).min(MAX_IDLE_STREAK);
            } else {
                self.idle_streak = 0;
            }

            let delay = backoff_delay(self.ctx.cfg.poll_interval_seconds, self.idle_streak);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.ctx.inner.notified() => {}
            }
        }
    }
}

struct WorkerFailure {
    job_id: String,
    exec_mode: ExecMode,
    error: anyhow::Error,
}

async fn attempt_job(
    ctx: &WorkerContext,
    message: &LeasedMessage,
) -> Result<ExecutionRecord, WorkerFailure> {
    let body = decode_message_body(&message.body, message.content_type.as_deref()).map_err(
        |err| WorkerFailure {
            job_id: UNKNOWN_JOB_ID.to_string(),
            exec_mode: ExecMode::Container,
            error: err.into(),
        },
    )?;

    let descriptor = JobDescriptor::from_body(&body).map_err(|err| WorkerFailure {
        job_id: body
            .get("job_id")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_JOB_ID)
            .to_string(),
        exec_mode: ExecMode::Container,
        error: err.into(),
    })?;

    let job_id = descriptor.job_id.clone();
    let exec_mode = descriptor.input.exec_mode;
    ctx.inner.emit(AgentEvent::JobStarted {
        job_id: job_id.clone(),
        exec_mode,
    });

    if exec_mode == ExecMode::Container {
        let _guard = ctx.sync_lock.lock().await;
        ensure_image_fresh(&ctx.cfg).await.map_err(|error| WorkerFailure {
            job_id: job_id.clone(),
            exec_mode,
            error,
        })?;
    }

    ctx.executor
        .execute(&descriptor)
        .await
        .map_err(|error| WorkerFailure {
            job_id,
            exec_mode,
            error,
        })
}

async fn run_worker(ctx: WorkerContext, lease_id: String, message: LeasedMessage) {
    let started = Instant::now();
    let attempts = message.attempts;

    let outcome = match attempt_job(&ctx, &message).await {
        Ok(record) => {
            // Publish before queueing the ack: every acked lease has a
            // published terminal event, at the cost of a possible duplicate
            // event if the agent dies in between.
            let mut event = ResultEvent::from_record(&record);
            event.attempts = Some(attempts);
            match ctx.queue.publish_result(&event).await {
                Ok(()) => {
                    ctx.outcomes.push(LeaseOutcome::Ack { lease_id });
                    JobOutcome {
                        job_id: record.job_id,
                        status: Some(record.status),
                        disposition: LeaseDisposition::Acked,
                        error: None,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }
                }
                Err(err) => {
                    ctx.inner.emit_error(format!(
                        "result publish failed for job {}: {err:#}; leaving lease to expire",
                        record.job_id
                    ));
                    JobOutcome {
                        job_id: record.job_id,
                        status: Some(record.status),
                        disposition: LeaseDisposition::Abandoned,
                        error: Some(format!("{err:#}")),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }
                }
            }
        }
        Err(failure) => {
            let error_text = format!("{:#}", failure.error);
            if attempts < ctx.cfg.max_retry_attempts {
                ctx.outcomes.push(LeaseOutcome::Retry {
                    lease_id,
                    delay_seconds: ctx.cfg.retry_delay_seconds,
                });
                JobOutcome {
                    job_id: failure.job_id,
                    status: None,
                    disposition: LeaseDisposition::Retried,
                    error: Some(error_text),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            } else {
                // Retry budget exhausted: ack with a synthesised failure so
                // the message stops redelivering.
                let event = ResultEvent::synthesized_failure(
                    &failure.job_id,
                    failure.exec_mode,
                    &error_text,
                    attempts,
                );
                match ctx.queue.publish_result(&event).await {
                    Ok(()) => {
                        ctx.outcomes.push(LeaseOutcome::Ack { lease_id });
                        JobOutcome {
                            job_id: failure.job_id,
                            status: Some(JobStatus::Failed),
                            disposition: LeaseDisposition::Acked,
                            error: Some(error_text),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                    Err(err) => {
                        ctx.inner.emit_error(format!(
                            "synthesised failure publish failed for job {}: {err:#}; leaving lease to expire",
                            failure.job_id
                        ));
                        JobOutcome {
                            job_id: failure.job_id,
                            status: None,
                            disposition: LeaseDisposition::Abandoned,
                            error: Some(error_text),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                }
            }
        }
    };

    ctx.inner.emit(AgentEvent::JobFinished { outcome });
}

pub(crate) fn start_agent(config: Config) -> AgentHandle {
    spawn_agent(config, None)
}

pub(crate) fn start_agent_with_transport(
    config: Config,
    queue: Arc<dyn QueueTransport>,
) -> AgentHandle {
    spawn_agent(config, Some(queue))
}

fn spawn_agent(config: Config, queue: Option<Arc<dyn QueueTransport>>) -> AgentHandle {
    let (event_tx, _) = broadcast::channel::<AgentEvent>(1024);
    let inner = Arc::new(AgentInner {
        event_tx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let join = tokio::spawn(run_agent(inner.clone(), config, queue));
    AgentHandle { inner, join }
}

async fn run_agent(
    inner: Arc<AgentInner>,
    config: Config,
    queue: Option<Arc<dyn QueueTransport>>,
) -> anyhow::Result<AgentExit> {
    let result = run_agent_inner(&inner, config, queue).await;
    if let Err(err) = &result {
        inner.emit_error(format!("agent runtime error: {err:#}"));
    }
    inner.emit(AgentEvent::Stopped);
    result
}

async fn run_agent_inner(
    inner: &Arc<AgentInner>,
    config: Config,
    queue: Option<Arc<dyn QueueTransport>>,
) -> anyhow::Result<AgentExit> {
    let cfg = Arc::new(config);
    let queue: Arc<dyn QueueTransport> = match queue {
        Some(queue) => queue,
        None => Arc::new(QueueClient::new(&cfg)?),
    };
    let sync_lock = Arc::new(Mutex::new(()));
    let runtime: Arc<dyn CommandRuntime> = Arc::new(ProcessRuntime);
    let executor = Arc::new(Executor::new(cfg.clone(), runtime, sync_lock.clone()));

    let heartbeat_task = tokio::spawn(heartbeat::run_heartbeat(
        queue.clone(),
        cfg.heartbeat_interval_seconds,
        inner.clone(),
    ));

    let lease_loop = LeaseLoop {
        ctx: WorkerContext {
            cfg,
            queue,
            executor,
            outcomes: Arc::new(OutcomeBuffer::default()),
            sync_lock,
            inner: inner.clone(),
        },
        workers: JoinSet::new(),
        idle_streak: 0,
        announced_drain: false,
    };

    let result = lease_loop.run().await;
    heartbeat_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        assert_eq!(backoff_delay(2.0, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(2.0, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(2.0, 2), Duration::from_secs(8));
        assert_eq!(backoff_delay(2.0, 3), Duration::from_secs(16));
        assert_eq!(backoff_delay(2.0, 4), Duration::from_secs(30));
        assert_eq!(backoff_delay(2.0, 8), Duration::from_secs(30));
        // The streak saturates; a larger value behaves like 8.
        assert_eq!(backoff_delay(2.0, 40), Duration::from_secs(30));
    }

    #[test]
    fn backoff_respects_the_floor() {
        assert_eq!(backoff_delay(0.25, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(0.25, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(0.25, 3), Duration::from_secs(2));
    }

    #[test]
    fn backoff_is_monotone_in_the_streak() {
        let mut last = Duration::ZERO;
        for streak in 0..=12 {
            let delay = backoff_delay(2.0, streak);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn stop_wins_over_the_sentinel() {
        assert_eq!(resolve_state(false, false), LoopState::Polling);
        assert_eq!(resolve_state(false, true), LoopState::Draining);
        assert_eq!(resolve_state(true, false), LoopState::Terminating);
        assert_eq!(resolve_state(true, true), LoopState::Terminating);
    }
}
