//! Lease-loop tests against a scripted queue transport.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::timeout;

use hpcq_agent_core::config::Config;
use hpcq_agent_engine::{
    start_agent_with_transport, AgentExit, HeartbeatEvent, JobStatus, LeasedMessage,
    QueueTransport, ResultEvent,
};

// Serves scripted pull batches and records everything the agent submits.
#[derive(Default)]
struct StubQueue {
    batches: Mutex<VecDeque<Vec<LeasedMessage>>>,
    pulls: AtomicU32,
    acks: Mutex<Vec<String>>,
    retries: Mutex<Vec<(String, u32)>>,
    results: Mutex<Vec<ResultEvent>>,
    heartbeats: AtomicU32,
}

impl StubQueue {
    fn with_batches(batches: Vec<Vec<LeasedMessage>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        })
    }

    fn pulls(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }

    fn acks(&self) -> Vec<String> {
        self.acks.lock().unwrap().clone()
    }

    fn retries(&self) -> Vec<(String, u32)> {
        self.retries.lock().unwrap().clone()
    }

    fn results(&self) -> Vec<ResultEvent> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueTransport for StubQueue {
    async fn pull(
        &self,
        _batch_size: u32,
        _visibility_timeout_ms: u32,
    ) -> anyhow::Result<Vec<LeasedMessage>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn ack_batch(
        &self,
        acks: Vec<String>,
        retries: Vec<(String, u32)>,
    ) -> anyhow::Result<()> {
        self.acks.lock().unwrap().extend(acks);
        self.retries.lock().unwrap().extend(retries);
        Ok(())
    }

    async fn publish_result(&self, event: &ResultEvent) -> anyhow::Result<()> {
        self.results.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_heartbeat(&self, _event: &HeartbeatEvent) -> anyhow::Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        api_base: "https://api.example.com".to_string(),
        account_id: "acct".to_string(),
        jobs_queue_id: "jobs".to_string(),
        results_queue_id: "res".to_string(),
        api_token: "tok".to_string(),
        batch_size: 100,
        visibility_timeout_ms: 120_000,
        poll_interval_seconds: 0.1,
        retry_delay_seconds: 30,
        max_retry_attempts: 5,
        heartbeat_interval_seconds: 600.0,
        results_dir: root.join("results"),
        state_dir: root.to_path_buf(),
        container_bin: "apptainer".to_string(),
        container_image: root.join("runtime.sif"),
        container_cmd: "python /app/run.py".to_string(),
        container_extra_bind: None,
        image_refresh_cmd: None,
        external_repos_root: root.join("repos"),
        external_repos: Vec::new(),
    }
}

fn message(lease_id: &str, attempts: u32, body: Value) -> LeasedMessage {
    LeasedMessage {
        lease_id: Some(lease_id.to_string()),
        attempts,
        content_type: None,
        body,
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn undecodable_messages_retry_until_exhaustion_then_ack_a_synthesised_failure() {
    let root = TempDir::new().unwrap();
    let garbage = Value::String("%%% not base64 and not json".to_string());

    // Five deliveries within the retry budget, then a sixth at the cap.
    let early: Vec<LeasedMessage> = (0..5)
        .map(|attempts| message(&format!("L{attempts}"), attempts, garbage.clone()))
        .collect();
    let last = vec![message("L5", 5, garbage.clone())];
    let stub = StubQueue::with_batches(vec![early, last]);

    let handle = start_agent_with_transport(test_config(root.path()), stub.clone());

    wait_until("five retries and one ack", || {
        stub.retries().len() == 5 && stub.acks().len() == 1
    })
    .await;

    handle.request_stop();
    let exit = timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("agent did not stop")
        .unwrap();
    assert_eq!(exit, AgentExit::Terminated);

    let mut retried: Vec<String> = stub
        .retries()
        .iter()
        .map(|(lease_id, delay)| {
            assert_eq!(*delay, 30);
            lease_id.clone()
        })
        .collect();
    retried.sort();
    assert_eq!(retried, ["L0", "L1", "L2", "L3", "L4"]);
    assert_eq!(stub.acks(), ["L5"]);

    // Only the exhausted delivery produced an event, and it is a synthesised
    // failure attributed to the unknown job.
    let results = stub.results();
    assert_eq!(results.len(), 1);
    let event = &results[0];
    assert_eq!(event.job_id, "unknown");
    assert_eq!(event.status, JobStatus::Failed);
    assert_eq!(event.event_type, JobStatus::Failed);
    assert!(event.result_pointer.is_none());
    assert_eq!(event.attempts, Some(5));
    assert!(event.stderr_tail.contains("unable to decode message body"));

    assert!(stub.heartbeats.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn reload_sentinel_drains_in_flight_leases_then_exits() {
    let root = TempDir::new().unwrap();
    let config = test_config(root.path());
    let sentinel = config.drain_sentinel_path();

    let job = |id: &str| {
        json!({
            "job_id": id,
            "input": {"command": "sleep 1.5; echo drained", "exec_mode": "host"}
        })
    };
    let stub = StubQueue::with_batches(vec![vec![
        message("D1", 0, job("d1")),
        message("D2", 0, job("d2")),
    ]]);

    let handle = start_agent_with_transport(config, stub.clone());

    // Request a reload while both workers are still executing.
    wait_until("first pull", || stub.pulls() >= 1).await;
    std::fs::write(&sentinel, b"").unwrap();

    let exit = timeout(Duration::from_secs(30), handle.wait())
        .await
        .expect("agent did not drain")
        .unwrap();
    assert_eq!(exit, AgentExit::Drained);

    // No pull was issued after the sentinel appeared, in-flight work was
    // acked, and the sentinel was consumed.
    assert_eq!(stub.pulls(), 1);
    let mut acks = stub.acks();
    acks.sort();
    assert_eq!(acks, ["D1", "D2"]);
    assert!(stub.retries().is_empty());
    assert!(!sentinel.exists());

    let results = stub.results();
    assert_eq!(results.len(), 2);
    for event in &results {
        assert_eq!(event.status, JobStatus::Completed);
        assert_eq!(event.exit_code, Some(0));
        let pointer = event.result_pointer.as_deref().expect("result pointer");
        assert!(Path::new(pointer).exists());
    }
}
