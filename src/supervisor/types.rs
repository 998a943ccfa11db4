//! Stream health types.
//!
//! # State Transitions
//!
//! ```text
//!               add_stream()
//!  (invalid) ──────────────────→ Failed
//!      │
//!      ↓
//! Connecting ──────────────────→ Streaming
//!      ↑  ↑                        │   │
//!      │  │  (transient error,     │   │ (trigger error,
//!      │  │   heartbeat timeout)   │   │  malformed event, gap)
//!      │  └──── Backoff ←──────────┘   ↓
//!      │                             Paused
//!      └─────────── retry_stream() ────┘
//!
//! remove_stream() / shutdown() from any state → Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Connecting**: reading the checkpoint and subscribing after it.
//! - **Streaming**: applying events in sequence order.
//! - **Backoff**: waiting before reconnecting from the durable checkpoint.
//! - **Paused**: halted on an event it must not skip. Needs an operator.
//! - **Stopped**: the consumer task has exited cleanly.
//! - **Failed**: the stream definition is invalid; it never started.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Health of one replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum StreamHealth {
    Connecting,
    Streaming,
    /// Reconnect scheduled after `attempt` consecutive failures.
    Backoff {
        attempt: usize,
        next_retry_at: DateTime<Utc>,
    },
    /// Stuck on `sequence_number` (if known) until retried.
    Paused {
        sequence_number: Option<u64>,
        reason: String,
    },
    Stopped,
    Failed(String),
}

impl StreamHealth {
    /// Short lowercase label (metrics and logs).
    pub fn label(&self) -> &'static str {
        match self {
            StreamHealth::Connecting => "connecting",
            StreamHealth::Streaming => "streaming",
            StreamHealth::Backoff { .. } => "backoff",
            StreamHealth::Paused { .. } => "paused",
            StreamHealth::Stopped => "stopped",
            StreamHealth::Failed(_) => "failed",
        }
    }

    /// Needs operator attention.
    pub fn needs_attention(&self) -> bool {
        matches!(self, StreamHealth::Paused { .. } | StreamHealth::Failed(_))
    }
}

impl fmt::Display for StreamHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHealth::Connecting => write!(f, "Connecting"),
            StreamHealth::Streaming => write!(f, "Streaming"),
            StreamHealth::Backoff {
                attempt,
                next_retry_at,
            } => write!(f, "Backoff(attempt={attempt}, next_retry_at={})", next_retry_at.to_rfc3339()),
            StreamHealth::Paused {
                sequence_number: Some(seq),
                reason,
            } => write!(f, "Paused(seq={seq}): {reason}"),
            StreamHealth::Paused { reason, .. } => write!(f, "Paused: {reason}"),
            StreamHealth::Stopped => write!(f, "Stopped"),
            StreamHealth::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Health of one stream as reported by [`HealthCheck`].
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub consumer_id: String,
    pub health: StreamHealth,
}

/// Snapshot of every registered stream.
///
/// Collected from watch channels only; no I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub streams: Vec<StreamStatus>,
    pub streams_total: usize,
    pub streams_streaming: usize,
    pub streams_backoff: usize,
    /// Paused or failed.
    pub streams_attention: usize,
    /// No stream needs an operator.
    pub healthy: bool,
}

impl HealthCheck {
    pub fn from_streams(streams: Vec<StreamStatus>) -> Self {
        let count = |label: &str| streams.iter().filter(|s| s.health.label() == label).count();
        let streams_streaming = count("streaming");
        let streams_backoff = count("backoff");
        let streams_attention = streams.iter().filter(|s| s.health.needs_attention()).count();

        Self {
            streams_total: streams.len(),
            streams_streaming,
            streams_backoff,
            streams_attention,
            healthy: streams_attention == 0,
            streams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_health_display() {
        assert_eq!(StreamHealth::Connecting.to_string(), "Connecting");
        assert_eq!(StreamHealth::Streaming.to_string(), "Streaming");
        assert_eq!(StreamHealth::Stopped.to_string(), "Stopped");
        assert_eq!(StreamHealth::Failed("bad query".into()).to_string(), "Failed: bad query");
        assert_eq!(
            StreamHealth::Paused {
                sequence_number: Some(7),
                reason: "no attributes".into()
            }
            .to_string(),
            "Paused(seq=7): no attributes"
        );
        let backoff = StreamHealth::Backoff {
            attempt: 2,
            next_retry_at: Utc::now(),
        };
        assert!(backoff.to_string().starts_with("Backoff(attempt=2"));
    }

    #[test]
    fn test_health_check_counts() {
        let status = |id: &str, health| StreamStatus {
            consumer_id: id.into(),
            health,
        };
        let hc = HealthCheck::from_streams(vec![
            status("a", StreamHealth::Streaming),
            status("b", StreamHealth::Streaming),
            status("c", StreamHealth::Backoff { attempt: 1, next_retry_at: Utc::now() }),
        ]);
        assert_eq!(hc.streams_total, 3);
        assert_eq!(hc.streams_streaming, 2);
        assert_eq!(hc.streams_backoff, 1);
        assert!(hc.healthy);

        let hc = HealthCheck::from_streams(vec![status("a", StreamHealth::Failed("x".into()))]);
        assert_eq!(hc.streams_attention, 1);
        assert!(!hc.healthy);
    }

    #[test]
    fn test_health_serializes_tagged() {
        let v = serde_json::to_value(StreamHealth::Paused {
            sequence_number: Some(3),
            reason: "r".into(),
        })
        .unwrap();
        assert_eq!(v["state"], "paused");
        assert_eq!(v["detail"]["sequence_number"], 3);

        let v = serde_json::to_value(StreamHealth::Failed("bad".into())).unwrap();
        assert_eq!(v["detail"], "bad");
    }
}
