// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence and the atomic commit primitive.
//!
//! Stores the last applied sequence number for each consumer in the
//! destination store itself, so that the checkpoint and the data it
//! describes can be written in the same atomic batch.
//!
//! ## Checkpoint Semantics
//!
//! The checkpoint stores the **last durably applied** sequence number.
//! On restart, the consumer resumes strictly after it.
//!
//! ```text
//! event 41 → triggers → put_batch(writes + checkpoint=41)
//!                          (crash before = nothing applied, 41 re-read)
//!                          (crash after  = 41 replays, observes Conflict)
//! ```
//!
//! ## Propose Protocol
//!
//! 1. Read the checkpoint record. If it already covers the range, return
//!    `Conflict` without writing anything.
//! 2. Resolve intents into conditional ops: one op per key, latest intent
//!    wins, merges folded onto the current record, each op guarded by the
//!    etag that was read.
//! 3. Append the checkpoint write guarded by its own etag (or `Absent`).
//! 4. `put_batch`. On a precondition failure start over: a racing writer
//!    either advanced the checkpoint (step 1 reports Conflict) or touched a
//!    data key (step 2 re-reads it).

use crate::error::StoreError;
use crate::intent::{apply_merge, IntentOp, WriteIntent};
use crate::store::{BatchOp, KvStore, Precondition, Record};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bucket holding checkpoint records.
pub const DEFAULT_CHECKPOINT_BUCKET: &str = "replicator_checkpoints";

/// Attempts at a propose before precondition contention is reported.
const PROPOSE_MAX_ATTEMPTS: u32 = 5;

/// Durable position of one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub consumer_id: String,
    pub bucket: String,
    pub key: String,
    pub last_sequence_number: u64,
}

/// Document stored under the checkpoint key.
#[derive(Debug, Deserialize)]
struct CheckpointDoc {
    last_sequence_number: u64,
}

/// Inclusive range of sequence numbers committed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
}

impl SequenceRange {
    pub fn single(seq: u64) -> Self {
        Self { first: seq, last: seq }
    }

    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// Writes and checkpoint advance are durable.
    Applied,
    /// Checkpoint already at `current >= first`; nothing was written.
    Conflict { current: u64 },
}

/// Checkpoint store over a destination [`KvStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KvStore>,
    bucket: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn KvStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Read a consumer's checkpoint. `None` if it never committed.
    pub async fn get(&self, consumer_id: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        Ok(self
            .read(consumer_id)
            .await?
            .map(|(seq, _)| self.record(consumer_id, seq)))
    }

    /// Atomically apply `intents` and advance the checkpoint to `range.last`,
    /// only if the stored checkpoint is below `range.first`.
    pub async fn propose_update(
        &self,
        consumer_id: &str,
        range: SequenceRange,
        intents: &[WriteIntent],
    ) -> Result<ProposeOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let current = self.read(consumer_id).await?;
            if let Some((seq, _)) = &current {
                if *seq >= range.first {
                    debug!(consumer_id, current = seq, first = range.first, "Checkpoint already covers range");
                    return Ok(ProposeOutcome::Conflict { current: *seq });
                }
            }

            let mut ops = self.resolve(intents).await?;
            ops.push(self.checkpoint_op(consumer_id, range.last, current.as_ref().map(|(_, r)| r)));

            match self.store.put_batch(ops).await {
                Ok(()) => {
                    debug!(consumer_id, first = range.first, last = range.last, "Checkpoint advanced");
                    return Ok(ProposeOutcome::Applied);
                }
                Err(StoreError::PreconditionFailed { bucket, key }) if attempt < PROPOSE_MAX_ATTEMPTS => {
                    warn!(consumer_id, %bucket, %key, attempt, "Concurrent modification, re-resolving batch");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record(&self, consumer_id: &str, seq: u64) -> CheckpointRecord {
        CheckpointRecord {
            consumer_id: consumer_id.to_string(),
            bucket: self.bucket.clone(),
            key: consumer_id.to_string(),
            last_sequence_number: seq,
        }
    }

    async fn read(&self, consumer_id: &str) -> Result<Option<(u64, Record)>, StoreError> {
        let Some(record) = self.store.get(&self.bucket, consumer_id).await? else {
            return Ok(None);
        };
        let doc: CheckpointDoc =
            serde_json::from_value(record.value.clone()).map_err(|e| StoreError::Corrupt {
                bucket: self.bucket.clone(),
                key: consumer_id.to_string(),
                message: e.to_string(),
            })?;
        Ok(Some((doc.last_sequence_number, record)))
    }

    fn checkpoint_op(&self, consumer_id: &str, seq: u64, current: Option<&Record>) -> BatchOp {
        let value = json!({
            "consumer_id": consumer_id,
            "last_sequence_number": seq,
            "updated_at": chrono::Utc::now().timestamp_millis(),
        });
        BatchOp::put(&self.bucket, consumer_id, value).with_precondition(Precondition::from_current(current))
    }

    /// Fold intents into one conditional op per key, in first-touch order.
    async fn resolve(&self, intents: &[WriteIntent]) -> Result<Vec<BatchOp>, StoreError> {
        struct Slot {
            precondition: Precondition,
            value: Option<Value>,
        }

        let mut order: Vec<(String, String)> = Vec::new();
        let mut slots: HashMap<(String, String), Slot> = HashMap::new();

        for intent in intents {
            let k = (intent.bucket.clone(), intent.key.clone());
            if !slots.contains_key(&k) {
                let current = self.store.get(&intent.bucket, &intent.key).await?;
                slots.insert(
                    k.clone(),
                    Slot {
                        precondition: Precondition::from_current(current.as_ref()),
                        value: current.map(|r| r.value),
                    },
                );
                order.push(k.clone());
            }

            if let Some(slot) = slots.get_mut(&k) {
                slot.value = match intent.op {
                    IntentOp::Put => Some(intent.value.clone()),
                    IntentOp::Delete => None,
                    IntentOp::Merge => Some(apply_merge(slot.value.as_ref(), &intent.value)),
                };
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|k| {
                let slot = slots.remove(&k)?;
                let (bucket, key) = k;
                let op = match slot.value {
                    Some(value) => BatchOp::put(bucket, key, value),
                    None => BatchOp::delete(bucket, key),
                };
                Some(op.with_precondition(slot.precondition))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, CheckpointStore) {
        let mem = Arc::new(MemoryStore::new());
        let cp = CheckpointStore::new(mem.clone(), DEFAULT_CHECKPOINT_BUCKET);
        (mem, cp)
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (_, cp) = setup();
        assert!(cp.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_propose_applies_and_advances() {
        let (mem, cp) = setup();
        let out = cp
            .propose_update("c1", SequenceRange::single(1), &[WriteIntent::put("m", "a", json!({"x": 1}))])
            .await
            .unwrap();
        assert_eq!(out, ProposeOutcome::Applied);

        let rec = cp.get("c1").await.unwrap().unwrap();
        assert_eq!(rec.last_sequence_number, 1);
        assert_eq!(rec.bucket, DEFAULT_CHECKPOINT_BUCKET);
        assert_eq!(rec.key, "c1");
        assert_eq!(mem.bucket("m").await.get("a"), Some(&json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_replay_conflicts_without_writing() {
        let (mem, cp) = setup();
        let intents = [WriteIntent::put("m", "a", json!(1))];
        cp.propose_update("c1", SequenceRange::single(5), &intents).await.unwrap();
        let batches = mem.batches_applied();

        let out = cp
            .propose_update("c1", SequenceRange::single(5), &[WriteIntent::put("m", "a", json!(2))])
            .await
            .unwrap();
        assert_eq!(out, ProposeOutcome::Conflict { current: 5 });
        assert_eq!(mem.batches_applied(), batches);
        assert_eq!(mem.bucket("m").await.get("a"), Some(&json!(1)));

        // older events conflict too
        let out = cp.propose_update("c1", SequenceRange::single(3), &[]).await.unwrap();
        assert_eq!(out, ProposeOutcome::Conflict { current: 5 });
    }

    #[tokio::test]
    async fn test_range_overlapping_checkpoint_conflicts() {
        let (_, cp) = setup();
        cp.propose_update("c1", SequenceRange::new(1, 4), &[]).await.unwrap();
        let out = cp.propose_update("c1", SequenceRange::new(4, 6), &[]).await.unwrap();
        assert_eq!(out, ProposeOutcome::Conflict { current: 4 });
        assert_eq!(cp.get("c1").await.unwrap().unwrap().last_sequence_number, 4);
    }

    #[tokio::test]
    async fn test_consumers_are_independent() {
        let (_, cp) = setup();
        cp.propose_update("c1", SequenceRange::single(9), &[]).await.unwrap();
        let out = cp.propose_update("c2", SequenceRange::single(1), &[]).await.unwrap();
        assert_eq!(out, ProposeOutcome::Applied);
    }

    #[tokio::test]
    async fn test_resolve_latest_wins_and_merges() {
        let (mem, cp) = setup();
        cp.propose_update("c1", SequenceRange::single(1), &[WriteIntent::put("m", "a", json!({"cn": ["a"], "sn": ["x"]}))])
            .await
            .unwrap();

        let intents = [
            WriteIntent::merge("m", "a", json!({"mail": ["a@x"]})),
            WriteIntent::merge("m", "a", json!({"sn": null})),
            WriteIntent::put("m", "b", json!(1)),
            WriteIntent::delete("m", "b"),
        ];
        cp.propose_update("c1", SequenceRange::new(2, 3), &intents).await.unwrap();

        let bucket = mem.bucket("m").await;
        assert_eq!(bucket.get("a"), Some(&json!({"cn": ["a"], "mail": ["a@x"]})));
        assert!(bucket.get("b").is_none());
    }

    #[tokio::test]
    async fn test_store_unavailable_surfaces() {
        let (mem, cp) = setup();
        mem.fail_next_batches(1);
        let err = cp
            .propose_update("c1", SequenceRange::single(1), &[WriteIntent::put("m", "a", json!(1))])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(cp.get("c1").await.unwrap().is_none());
        assert!(mem.bucket("m").await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_reported() {
        let (mem, cp) = setup();
        mem.put_batch(vec![BatchOp::put(DEFAULT_CHECKPOINT_BUCKET, "c1", json!("garbage"))])
            .await
            .unwrap();
        assert!(matches!(cp.get("c1").await.unwrap_err(), StoreError::Corrupt { .. }));
    }
}
