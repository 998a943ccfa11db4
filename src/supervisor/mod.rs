// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication supervisor.
//!
//! Owns one [`ChangeConsumer`] task per configured stream, all reading from
//! the same [`ChangeFeed`] and writing to the same [`KvStore`]. Streams
//! share nothing else: each has its own trigger pipeline, checkpoint key,
//! circuit breaker and shutdown channel.
//!
//! # Lifecycle
//!
//! 1. [`add_stream`](ReplicationSupervisor::add_stream) validates the
//!    definition and spawns the consumer. Invalid definitions are recorded
//!    as [`StreamHealth::Failed`] and returned as configuration errors.
//! 2. Consumers recover from transient failures on their own and report
//!    every transition through a watch channel.
//! 3. [`remove_stream`](ReplicationSupervisor::remove_stream) and
//!    [`shutdown`](ReplicationSupervisor::shutdown) signal the consumer and
//!    wait for its in-flight commit to finish.

mod types;

pub use types::{HealthCheck, StreamHealth, StreamStatus};

use crate::checkpoint::{CheckpointStore, DEFAULT_CHECKPOINT_BUCKET};
use crate::circuit_breaker::CircuitConfig;
use crate::config::StreamConfig;
use crate::consumer::{ChangeConsumer, ConsumerSettings};
use crate::error::{ReplicationError, Result};
use crate::feed::ChangeFeed;
use crate::metrics;
use crate::store::KvStore;
use crate::trigger::TriggerRegistry;
use crate::writer::DestinationWriter;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings shared by every stream of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub checkpoint_bucket: String,
    pub consumer: ConsumerSettings,
    pub circuit: CircuitConfig,
    /// How long stop waits for a consumer to finish its commit.
    pub drain_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            checkpoint_bucket: DEFAULT_CHECKPOINT_BUCKET.to_string(),
            consumer: ConsumerSettings::default(),
            circuit: CircuitConfig::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorSettings {
    pub fn testing() -> Self {
        Self {
            checkpoint_bucket: DEFAULT_CHECKPOINT_BUCKET.to_string(),
            consumer: ConsumerSettings::testing(),
            circuit: CircuitConfig::testing(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

struct StreamEntry {
    health_rx: watch::Receiver<StreamHealth>,
    /// `None` for streams that never started.
    running: Option<RunningStream>,
    /// A remove is waiting for the consumer to exit.
    stopping: bool,
}

struct RunningStream {
    stop_tx: watch::Sender<bool>,
    resume: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl StreamEntry {
    fn failed(reason: String) -> Self {
        let (_, health_rx) = watch::channel(StreamHealth::Failed(reason));
        Self {
            health_rx,
            running: None,
            stopping: false,
        }
    }
}

pub struct ReplicationSupervisor {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn KvStore>,
    registry: TriggerRegistry,
    settings: SupervisorSettings,
    streams: RwLock<BTreeMap<String, StreamEntry>>,
    shutting_down: AtomicBool,
}

impl ReplicationSupervisor {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn KvStore>,
        registry: TriggerRegistry,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            feed,
            store,
            registry,
            settings,
            streams: RwLock::new(BTreeMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Validate a stream definition and start its consumer.
    ///
    /// An invalid definition is kept as [`StreamHealth::Failed`] so it shows
    /// up in health checks; remove it before re-adding.
    pub async fn add_stream(&self, config: StreamConfig) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }
        if config.consumer_id.trim().is_empty() {
            return Err(ReplicationError::Config("stream consumer_id must not be empty".into()));
        }

        let mut streams = self.streams.write().await;
        if streams.contains_key(&config.consumer_id) {
            return Err(ReplicationError::Config(format!(
                "duplicate stream consumer_id '{}'",
                config.consumer_id
            )));
        }

        let consumer = match self.prepare(&config) {
            Ok(c) => c,
            Err(e) => {
                error!(consumer_id = %config.consumer_id, error = %e, "Stream failed to start");
                metrics::set_stream_state(&config.consumer_id, "failed");
                streams.insert(config.consumer_id.clone(), StreamEntry::failed(e.to_string()));
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let health_rx = consumer.health();
        let resume = consumer.resume_handle();
        let handle = tokio::spawn(consumer.run(stop_rx));

        info!(consumer_id = %config.consumer_id, base_dn = %config.source_query.base_dn, "Spawned stream");
        streams.insert(
            config.consumer_id,
            StreamEntry {
                health_rx,
                running: Some(RunningStream {
                    stop_tx,
                    resume,
                    handle,
                }),
                stopping: false,
            },
        );
        metrics::set_active_streams(streams.len());
        Ok(())
    }

    fn prepare(&self, config: &StreamConfig) -> Result<ChangeConsumer> {
        config.validate(&self.settings.checkpoint_bucket)?;

        let pipeline = self.registry.build(&config.consumer_id, &config.trigger_chain)?;
        let writer = DestinationWriter::new(
            config.consumer_id.clone(),
            CheckpointStore::new(Arc::clone(&self.store), self.settings.checkpoint_bucket.clone()),
            self.settings.circuit.clone(),
        );

        Ok(ChangeConsumer::new(
            config.source_query.clone(),
            Arc::clone(&self.feed),
            pipeline,
            writer,
            self.settings.consumer.clone(),
        ))
    }

    /// Stop a stream and forget it. Waits for an in-flight commit.
    ///
    /// A consumer that outlives the drain timeout stays registered (its id
    /// cannot be re-added) and the call fails; remove it again later.
    pub async fn remove_stream(&self, consumer_id: &str) -> Result<()> {
        let running = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(consumer_id) else {
                return Err(ReplicationError::Config(format!("unknown stream '{consumer_id}'")));
            };
            if entry.stopping {
                return Err(ReplicationError::InvalidState {
                    expected: "running".to_string(),
                    actual: "stopping".to_string(),
                });
            }
            entry.stopping = true;
            entry.running.take()
        };

        if let Some(running) = running {
            if let Some(running) = self.stop(consumer_id, running).await {
                let mut streams = self.streams.write().await;
                if let Some(entry) = streams.get_mut(consumer_id) {
                    entry.running = Some(running);
                    entry.stopping = false;
                }
                return Err(ReplicationError::InvalidState {
                    expected: "stopped".to_string(),
                    actual: "draining".to_string(),
                });
            }
        }

        let mut streams = self.streams.write().await;
        streams.remove(consumer_id);
        metrics::set_active_streams(streams.len());
        info!(consumer_id, "Stream removed");
        Ok(())
    }

    /// Signal the consumer and wait up to the drain timeout. Returns the
    /// stream back if it is still running.
    async fn stop(&self, consumer_id: &str, mut running: RunningStream) -> Option<RunningStream> {
        let _ = running.stop_tx.send(true);

        match tokio::time::timeout(self.settings.drain_timeout, &mut running.handle).await {
            Ok(Ok(())) => debug!(consumer_id, "Consumer exited"),
            Ok(Err(e)) => warn!(consumer_id, error = %e, "Consumer task panicked"),
            Err(_) => {
                error!(
                    consumer_id,
                    drain_timeout = ?self.settings.drain_timeout,
                    "Consumer did not stop within drain timeout, commit still in flight"
                );
                return Some(running);
            }
        }
        None
    }

    pub async fn health_of(&self, consumer_id: &str) -> Option<StreamHealth> {
        self.streams
            .read()
            .await
            .get(consumer_id)
            .map(|entry| entry.health_rx.borrow().clone())
    }

    /// Health receiver for one stream (for waiting on transitions).
    pub async fn watch_health(&self, consumer_id: &str) -> Option<watch::Receiver<StreamHealth>> {
        self.streams
            .read()
            .await
            .get(consumer_id)
            .map(|entry| entry.health_rx.clone())
    }

    /// Health of every stream. No I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let streams = self.streams.read().await;
        HealthCheck::from_streams(
            streams
                .iter()
                .map(|(id, entry)| StreamStatus {
                    consumer_id: id.clone(),
                    health: entry.health_rx.borrow().clone(),
                })
                .collect(),
        )
    }

    pub async fn stream_ids(&self) -> Vec<String> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Resume a paused stream, or cut a backoff short.
    ///
    /// The consumer reconnects from its durable checkpoint, so a paused
    /// stream sees the event it stopped on again.
    pub async fn retry_stream(&self, consumer_id: &str) -> Result<()> {
        let streams = self.streams.read().await;
        let entry = streams
            .get(consumer_id)
            .ok_or_else(|| ReplicationError::Config(format!("unknown stream '{consumer_id}'")))?;

        let health = entry.health_rx.borrow().clone();
        match (&health, &entry.running) {
            (StreamHealth::Paused { .. } | StreamHealth::Backoff { .. }, Some(running)) => {
                info!(consumer_id, from = health.label(), "Retrying stream");
                running.resume.notify_one();
                Ok(())
            }
            _ => Err(ReplicationError::InvalidState {
                expected: "paused or backoff".to_string(),
                actual: health.label().to_string(),
            }),
        }
    }

    /// Stop every stream, waiting for in-flight commits.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Shutting down replication supervisor");

        let entries: Vec<(String, StreamEntry)> = {
            let mut streams = self.streams.write().await;
            std::mem::take(&mut *streams).into_iter().collect()
        };

        let running: Vec<(String, RunningStream)> = entries
            .into_iter()
            .filter_map(|(id, entry)| entry.running.map(|r| (id, r)))
            .collect();

        if !running.is_empty() {
            info!(streams = running.len(), "Waiting for streams to drain");
        }
        // Stragglers are already logged; the runtime ends them.
        join_all(running.into_iter().map(|(id, r)| async move { self.stop(&id, r).await })).await;

        metrics::set_active_streams(0);
        info!("Replication supervisor stopped");
    }
}
