use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use hpcq_agent_core::node;

use crate::engine::AgentInner;
use crate::queue::QueueTransport;

pub(crate) const HEARTBEAT_SOURCE: &str = "hpc-consumer";

/// Liveness pulse appended to the results queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    /// Always `"heartbeat"`.
    pub event_type: String,
    /// Always `"alive"`.
    pub status: String,
    /// Emitting component identifier.
    pub source: String,
    /// Node hostname.
    pub hostname: String,
    /// Agent process id.
    pub pid: u32,
    /// RFC-3339 UTC timestamp of the pulse.
    pub timestamp: String,
}

impl HeartbeatEvent {
    pub(crate) fn now() -> Self {
        Self {
            event_type: "heartbeat".to_string(),
            status: "alive".to_string(),
            source: HEARTBEAT_SOURCE.to_string(),
            hostname: node::hostname(),
            pid: std::process::id(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// Publish a heartbeat immediately and then on a fixed cadence, independent
/// of lease activity. Publish failures are reported and swallowed; the task
/// exits cooperatively at its first wake after a stop request.
pub(crate) async fn run_heartbeat(
    queue: Arc<dyn QueueTransport>,
    interval_seconds: f64,
    inner: Arc<AgentInner>,
) {
    let interval = Duration::from_secs_f64(interval_seconds.max(1.0));

    loop {
        if inner.should_stop() {
            break;
        }

        if let Err(err) = queue.publish_heartbeat(&HeartbeatEvent::now()).await {
            inner.emit_warning(format!("heartbeat publish failed: {err:#}"));
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = inner.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_event_matches_the_published_schema() {
        let event = HeartbeatEvent::now();
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "heartbeat");
        assert_eq!(value["status"], "alive");
        assert_eq!(value["source"], "hpc-consumer");
        assert!(!value["hostname"].as_str().unwrap().is_empty());
        assert!(value["pid"].as_u64().unwrap() > 0);
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
