//! Shared test utilities for scenario, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Wiring for a supervised stream over the in-memory feed and store
//! - Attribute builders and wait helpers

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use directory_replicator::checkpoint::DEFAULT_CHECKPOINT_BUCKET;
use directory_replicator::config::StreamConfig;
use directory_replicator::event::Attributes;
use directory_replicator::feed::{MemoryFeed, SourceQuery};
use directory_replicator::store::MemoryStore;
use directory_replicator::supervisor::{ReplicationSupervisor, StreamHealth, SupervisorSettings};
use directory_replicator::trigger::{TriggerRegistry, TriggerSpec};
use std::sync::Arc;
use std::time::Duration;

pub const BASE_DN: &str = "ou=people,dc=example,dc=com";
pub const WAIT: Duration = Duration::from_secs(5);

/// Single-valued attributes.
pub fn attrs(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
        .collect()
}

pub fn person_dn(cn: &str) -> String {
    format!("cn={cn},{BASE_DN}")
}

/// Stream mirroring everything under [`BASE_DN`] into `mirror`.
pub fn mirror_stream(consumer_id: &str) -> StreamConfig {
    StreamConfig {
        consumer_id: consumer_id.to_string(),
        source_query: SourceQuery::subtree(BASE_DN),
        trigger_chain: vec![TriggerSpec::new("mirror", "mirror")],
    }
}

/// Feed, store and supervisor wired together with test timings.
pub struct Harness {
    pub feed: MemoryFeed,
    pub store: Arc<MemoryStore>,
    pub supervisor: ReplicationSupervisor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self::with(MemoryFeed::new(), store, SupervisorSettings::testing())
    }

    pub fn with(feed: MemoryFeed, store: Arc<MemoryStore>, settings: SupervisorSettings) -> Self {
        let supervisor = ReplicationSupervisor::new(
            Arc::new(feed.clone()),
            store.clone(),
            TriggerRegistry::with_builtins(),
            settings,
        );
        Self {
            feed,
            store,
            supervisor,
        }
    }

    pub async fn checkpoint(&self, consumer_id: &str) -> Option<u64> {
        checkpoint_of(&self.store, consumer_id).await
    }

    pub async fn wait_checkpoint(&self, consumer_id: &str, seq: u64) {
        wait_checkpoint(&self.store, consumer_id, seq).await
    }

    pub async fn wait_health<F>(&self, consumer_id: &str, f: F) -> StreamHealth
    where
        F: Fn(&StreamHealth) -> bool,
    {
        let mut rx = self
            .supervisor
            .watch_health(consumer_id)
            .await
            .expect("stream not registered");
        let health = tokio::time::timeout(WAIT, rx.wait_for(|h| f(h)))
            .await
            .expect("health transition timed out")
            .expect("stream dropped")
            .clone();
        health
    }
}

pub async fn checkpoint_of(store: &MemoryStore, consumer_id: &str) -> Option<u64> {
    store
        .bucket(DEFAULT_CHECKPOINT_BUCKET)
        .await
        .get(consumer_id)
        .and_then(|v| v["last_sequence_number"].as_u64())
}

pub async fn wait_checkpoint(store: &MemoryStore, consumer_id: &str, seq: u64) {
    tokio::time::timeout(WAIT, async {
        while checkpoint_of(store, consumer_id).await != Some(seq) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("checkpoint of '{consumer_id}' never reached {seq}"));
}

/// Poll until `cond` holds or the wait times out.
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
