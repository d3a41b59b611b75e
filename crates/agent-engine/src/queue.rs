use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hpcq_agent_core::config::Config;

use crate::api::ResultEvent;
use crate::heartbeat::HeartbeatEvent;

/// One leased message from the jobs queue.
#[derive(Debug, Clone, Deserialize)]
pub struct LeasedMessage {
    /// Lease identifier; messages without one cannot be acked and are
    /// skipped by the lease loop.
    #[serde(default)]
    pub lease_id: Option<String>,
    /// Number of prior deliveries the queue has made for this message.
    #[serde(default)]
    pub attempts: u32,
    /// Body-decoding hint (`json`, `text`, `bytes`, or absent).
    #[serde(default)]
    pub content_type: Option<String>,
    /// Raw message body.
    #[serde(default)]
    pub body: Value,
}

/// Transport over the remote pull queue, substitutable in tests the same way
/// [`crate::runtime::CommandRuntime`] substitutes the child-process layer.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Lease up to `batch_size` messages for `visibility_timeout_ms`. An
    /// empty batch is legal and common.
    async fn pull(
        &self,
        batch_size: u32,
        visibility_timeout_ms: u32,
    ) -> anyhow::Result<Vec<LeasedMessage>>;

    /// Atomically submit acks and `(lease_id, delay_seconds)` retries.
    /// Callers only invoke this with at least one non-empty list.
    async fn ack_batch(
        &self,
        acks: Vec<String>,
        retries: Vec<(String, u32)>,
    ) -> anyhow::Result<()>;

    /// Append a terminal result event to the results queue.
    async fn publish_result(&self, event: &ResultEvent) -> anyhow::Result<()>;

    /// Append a heartbeat event to the results queue.
    async fn publish_heartbeat(&self, event: &HeartbeatEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct PullRequest {
    batch_size: u32,
    visibility_timeout_ms: u32,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    result: Option<PullResult>,
}

// The queue reports "no messages" as `{result: {messages: []}}`, `{result:
// []}`, or `{result: {}}` depending on the path that produced the response.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PullResult {
    Batch {
        #[serde(default)]
        messages: Vec<LeasedMessage>,
    },
    List(Vec<LeasedMessage>),
}

impl Default for PullResult {
    fn default() -> Self {
        PullResult::Batch {
            messages: Vec::new(),
        }
    }
}

impl PullResult {
    fn into_messages(self) -> Vec<LeasedMessage> {
        match self {
            PullResult::Batch { messages } => messages,
            PullResult::List(messages) => messages,
        }
    }
}

#[derive(Debug, Serialize)]
struct AckEntry {
    lease_id: String,
}

#[derive(Debug, Serialize)]
struct RetryEntry {
    lease_id: String,
    delay_seconds: u32,
}

#[derive(Debug, Serialize)]
struct AckRequest {
    acks: Vec<AckEntry>,
    retries: Vec<RetryEntry>,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a, T: Serialize> {
    body: &'a T,
}

/// [`QueueTransport`] over the remote queue's HTTP surface.
///
/// Performs no internal retries; transport and HTTP-status failures surface
/// unchanged to the caller.
#[derive(Debug, Clone)]
pub struct QueueClient {
    http: reqwest::Client,
    jobs_base: String,
    results_base: String,
    token: String,
}

impl QueueClient {
    /// Build a client for the queues named by `config`.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            jobs_base: config.jobs_api_base(),
            results_base: config.results_api_base(),
            token: config.api_token.clone(),
        })
    }

    async fn post<T: Serialize>(&self, url: String, payload: &T) -> anyhow::Result<Value> {
        let res = self
            .http
            .post(url.as_str())
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(res.json().await?)
    }

    async fn publish<T: Serialize>(&self, event: &T) -> anyhow::Result<()> {
        self.post(self.results_base.clone(), &PublishRequest { body: event })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for QueueClient {
    async fn pull(
        &self,
        batch_size: u32,
        visibility_timeout_ms: u32,
    ) -> anyhow::Result<Vec<LeasedMessage>> {
        let resp = self
            .post(
                format!("{}/pull", self.jobs_base),
                &PullRequest {
                    batch_size,
                    visibility_timeout_ms,
                },
            )
            .await?;
        let parsed: PullResponse = serde_json::from_value(resp)?;
        Ok(parsed.result.unwrap_or_default().into_messages())
    }

    async fn ack_batch(
        &self,
        acks: Vec<String>,
        retries: Vec<(String, u32)>,
    ) -> anyhow::Result<()> {
        let payload = AckRequest {
            acks: acks.into_iter().map(|lease_id| AckEntry { lease_id }).collect(),
            retries: retries
                .into_iter()
                .map(|(lease_id, delay_seconds)| RetryEntry {
                    lease_id,
                    delay_seconds,
                })
                .collect(),
        };
        self.post(format!("{}/ack", self.jobs_base), &payload).await?;
        Ok(())
    }

    async fn publish_result(&self, event: &ResultEvent) -> anyhow::Result<()> {
        self.publish(event).await
    }

    async fn publish_heartbeat(&self, event: &HeartbeatEvent) -> anyhow::Result<()> {
        self.publish(event).await
    }
}
