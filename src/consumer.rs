// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change consumer: one task per replication stream.
//!
//! ```text
//! Disconnected ─→ Connecting ─→ Streaming ─┬─→ Backoff ─→ Connecting
//!                     ↑                    ├─→ Paused ──(retry)──┘
//!                     └──── (overlap) ─────┤
//!                                          └─→ Stopped
//! ```
//!
//! Each session starts by reading the durable checkpoint and subscribing
//! strictly after it, so the event cursor and the checkpoint converge on
//! every reconnect. Events at or below the cursor are dropped before the
//! pipeline; anything the feed redelivers past that is absorbed by the
//! writer's replay path.
//!
//! # Graceful Shutdown
//!
//! The shutdown signal is only raced against waiting for the next item.
//! A commit in flight always completes, and a partially filled batch is
//! committed before the task exits.
//!
//! # Fail-Closed
//!
//! Trigger errors, malformed events and sequence gaps never advance the
//! checkpoint. The consumer commits whatever precedes the offending event
//! and pauses until [`ReplicationSupervisor::retry_stream`] or shutdown.
//!
//! [`ReplicationSupervisor::retry_stream`]: crate::supervisor::ReplicationSupervisor::retry_stream

use crate::batch::{BatchConfig, CommitBatch};
use crate::error::ReplicationError;
use crate::feed::{ChangeFeed, ChangeSubscription, FeedItem, SourceQuery};
use crate::metrics;
use crate::resilience::{RateLimitConfig, RateLimiter, RetryConfig};
use crate::supervisor::StreamHealth;
use crate::trigger::TriggerPipeline;
use crate::writer::{CommitOutcome, DestinationWriter};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Per-stream runtime settings.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Longest wait for any feed item before the session is considered dead.
    pub heartbeat_timeout: Duration,
    pub batch: BatchConfig,
    /// Reconnect backoff.
    pub retry: RetryConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            batch: BatchConfig::default(),
            retry: RetryConfig::daemon(),
            rate_limit: None,
        }
    }
}

impl ConsumerSettings {
    /// Short timeouts and no jitter, for tests.
    pub fn testing() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(3),
            batch: BatchConfig::default(),
            retry: RetryConfig::testing(),
            rate_limit: None,
        }
    }
}

/// How a streaming session ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    /// Checkpoint moved under us; reconnect immediately.
    Resync,
}

pub struct ChangeConsumer {
    consumer_id: String,
    query: SourceQuery,
    feed: Arc<dyn ChangeFeed>,
    pipeline: TriggerPipeline,
    writer: DestinationWriter,
    settings: ConsumerSettings,
    rate_limiter: Option<RateLimiter>,
    health_tx: watch::Sender<StreamHealth>,
    resume: Arc<Notify>,
    /// Consecutive failed sessions.
    attempt: usize,
    /// Event the pipeline last refused.
    stalled_at: Option<u64>,
}

impl ChangeConsumer {
    pub fn new(
        query: SourceQuery,
        feed: Arc<dyn ChangeFeed>,
        pipeline: TriggerPipeline,
        writer: DestinationWriter,
        settings: ConsumerSettings,
    ) -> Self {
        let (health_tx, _) = watch::channel(StreamHealth::Connecting);
        Self {
            consumer_id: writer.consumer_id().to_string(),
            query,
            feed,
            pipeline,
            rate_limiter: settings.rate_limit.clone().map(RateLimiter::new),
            writer,
            settings,
            health_tx,
            resume: Arc::new(Notify::new()),
            attempt: 0,
            stalled_at: None,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Receiver for health transitions.
    pub fn health(&self) -> watch::Receiver<StreamHealth> {
        self.health_tx.subscribe()
    }

    /// Handle that wakes a paused or backing-off consumer.
    pub fn resume_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.resume)
    }

    fn set_health(&self, health: StreamHealth) {
        metrics::set_stream_state(&self.consumer_id, health.label());
        self.health_tx.send_replace(health);
    }

    /// Run until `shutdown_rx` turns true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("stream", consumer_id = %self.consumer_id);

        async move {
            info!(stages = self.pipeline.len(), "Starting change consumer");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                self.set_health(StreamHealth::Connecting);
                match self.session(&mut shutdown_rx).await {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Resync) => continue,
                    Err(ReplicationError::Config(reason)) => {
                        error!(%reason, "Stream configuration rejected by source");
                        self.set_health(StreamHealth::Failed(reason));
                        return;
                    }
                    Err(e) if e.is_retryable() => {
                        if !self.backoff(&e, &mut shutdown_rx).await {
                            break;
                        }
                    }
                    Err(e) => {
                        if !self.pause(&e, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
            }

            self.set_health(StreamHealth::Stopped);
            info!("Change consumer stopped");
        }
        .instrument(span)
        .await
    }

    /// Wait out a backoff period. Returns false on shutdown.
    async fn backoff(&mut self, cause: &ReplicationError, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let delay = self.settings.retry.delay_with_jitter(self.attempt);
        self.attempt += 1;

        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        warn!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Stream interrupted, backing off"
        );
        metrics::record_backoff(&self.consumer_id, self.attempt, delay);
        self.set_health(StreamHealth::Backoff {
            attempt: self.attempt,
            next_retry_at,
        });

        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => false,
            _ = self.resume.notified() => {
                info!("Backoff cut short by retry");
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Halt until retried. Returns false on shutdown.
    async fn pause(&mut self, cause: &ReplicationError, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let sequence_number = cause.sequence_number().or(self.stalled_at.take());
        error!(seq = ?sequence_number, error = %cause, "Stream paused, operator action required");

        if let ReplicationError::Trigger { stage_id, .. } = cause {
            metrics::record_trigger_error(&self.consumer_id, stage_id);
        }
        if let ReplicationError::SequenceGap { .. } = cause {
            metrics::record_sequence_gap(&self.consumer_id);
        }

        self.set_health(StreamHealth::Paused {
            sequence_number,
            reason: cause.to_string(),
        });

        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => false,
            _ = self.resume.notified() => {
                info!("Resuming paused stream from checkpoint");
                self.attempt = 0;
                true
            }
        }
    }

    /// One subscription from the durable checkpoint until it breaks.
    async fn session(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<SessionEnd, ReplicationError> {
        self.stalled_at = None;
        let checkpoint = self.writer.checkpoint().await?;
        let mut subscription = self.feed.subscribe(&self.query, checkpoint).await?;

        info!(checkpoint, feed = self.feed.name(), "Streaming from checkpoint");
        self.set_health(StreamHealth::Streaming);

        let mut cursor = checkpoint;
        let mut batch = CommitBatch::new();

        loop {
            let wait = match batch.remaining_linger(&self.settings.batch) {
                Some(linger) => linger.min(self.settings.heartbeat_timeout),
                None => self.settings.heartbeat_timeout,
            };

            let item = tokio::select! {
                biased;

                _ = wait_for_shutdown(shutdown_rx) => {
                    info!("Shutdown signal received");
                    self.flush(&mut batch).await?;
                    return Ok(SessionEnd::Shutdown);
                }

                item = tokio::time::timeout(wait, subscription.next_item()) => item,
            };

            let item = match item {
                Err(_elapsed) if !batch.is_empty() => {
                    if let Some(end) = self.flush(&mut batch).await? {
                        return Ok(end);
                    }
                    continue;
                }
                Err(_elapsed) => {
                    return Err(ReplicationError::transient_source(
                        "next_item",
                        format!("no item within heartbeat timeout {:?}", self.settings.heartbeat_timeout),
                    ));
                }
                Ok(Err(e)) => {
                    // Commit what preceded the failure; the rest is redelivered.
                    self.flush(&mut batch).await?;
                    return Err(e.into());
                }
                Ok(Ok(None)) => {
                    self.flush(&mut batch).await?;
                    return Err(ReplicationError::transient_source("next_item", "feed closed"));
                }
                Ok(Ok(Some(item))) => item,
            };

            let event = match item {
                FeedItem::Heartbeat => {
                    trace!("Heartbeat");
                    continue;
                }
                FeedItem::Event(event) => event,
            };

            metrics::record_events_received(&self.consumer_id, 1);
            let seq = event.sequence_number;
            if seq <= cursor {
                trace!(seq, cursor, "Dropping replayed event");
                metrics::record_events_skipped(&self.consumer_id, "replayed");
                continue;
            }

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            match self.pipeline.apply(&event) {
                Ok(intents) => {
                    debug!(seq, op = %event.operation, dn = %event.target_id, intents = intents.len(), "Event transformed");
                    batch.push(seq, intents);
                    cursor = seq;
                }
                Err(e) => {
                    self.stalled_at = Some(seq);
                    self.flush(&mut batch).await?;
                    return Err(e);
                }
            }

            if batch.is_full(&self.settings.batch) {
                if let Some(end) = self.flush(&mut batch).await? {
                    return Ok(end);
                }
            }
        }
    }

    /// Commit the pending batch, if any.
    async fn flush(&mut self, batch: &mut CommitBatch) -> Result<Option<SessionEnd>, ReplicationError> {
        let Some(range) = batch.range() else {
            return Ok(None);
        };
        metrics::record_batch(&self.consumer_id, batch.len(), batch.intents().len());

        let outcome = self.writer.commit(range, batch.intents()).await;
        batch.clear();

        match outcome? {
            CommitOutcome::Applied => {
                self.attempt = 0;
                Ok(None)
            }
            CommitOutcome::AlreadyApplied { current } => {
                debug!(first = range.first, last = range.last, current, "Already applied");
                self.attempt = 0;
                Ok(None)
            }
            CommitOutcome::Overlap { current } => {
                warn!(first = range.first, last = range.last, current, "Checkpoint inside batch, resyncing");
                Ok(Some(SessionEnd::Resync))
            }
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    // wait_for checks the current value first.
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
