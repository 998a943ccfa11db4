//! In-process store simulator.
//!
//! Behaves like a real atomic KV store and adds fault injection for tests:
//!
//! - [`fail_next_batches`](MemoryStore::fail_next_batches): reject the next
//!   N batches with `Unavailable` before touching anything.
//! - [`crash_mid_batch`](MemoryStore::crash_mid_batch): arm a one-shot crash
//!   that fires after N ops of the next batch were staged. The staged copy is
//!   dropped, so recovery sees both-or-neither.
//! - [`set_available`](MemoryStore::set_available): take the whole store
//!   offline (gets and batches fail).
//! - [`set_commit_delay`](MemoryStore::set_commit_delay): slow batches down,
//!   for cancellation tests.

use super::{BatchAction, BatchOp, BoxFuture, KvStore, Record};
use crate::error::StoreError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

type Key = (String, String);

pub struct MemoryStore {
    data: RwLock<HashMap<Key, Record>>,
    available: AtomicBool,
    fail_batches: AtomicUsize,
    /// ops to stage before crashing; usize::MAX = disarmed
    crash_after: AtomicUsize,
    commit_delay_ms: AtomicU64,
    batches_applied: AtomicU64,
    batches_rejected: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_batches: AtomicUsize::new(0),
            crash_after: AtomicUsize::new(usize::MAX),
            commit_delay_ms: AtomicU64::new(0),
            batches_applied: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn fail_next_batches(&self, n: usize) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    pub fn crash_mid_batch(&self, after_ops: usize) {
        self.crash_after.store(after_ops, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// All records of a bucket, ordered by key.
    pub async fn bucket(&self, bucket: &str) -> BTreeMap<String, Value> {
        self.data
            .read()
            .await
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Number of records across all buckets.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::SeqCst)
    }

    pub fn batches_rejected(&self) -> u64 {
        self.batches_rejected.load(Ordering::SeqCst)
    }

    fn check_available(&self, operation: &str) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable(operation, "store offline"))
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn apply(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.check_available("put_batch")?;
        if self.take_injected_failure() {
            self.batches_rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::unavailable("put_batch", "injected failure"));
        }

        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let crash_after = self.crash_after.swap(usize::MAX, Ordering::SeqCst);

        for (i, op) in ops.iter().enumerate() {
            if i == crash_after {
                debug!(staged_ops = i, "Simulated crash mid-batch");
                self.batches_rejected.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::unavailable("put_batch", "simulated crash"));
            }

            let key = (op.bucket.clone(), op.key.clone());
            let current = staged.get(&key).map(|r| r.etag.as_str());
            if !op.precondition.holds(current) {
                self.batches_rejected.fetch_add(1, Ordering::SeqCst);
                return Err(op.precondition_failed());
            }

            match &op.action {
                BatchAction::Put(value) => {
                    staged.insert(key, Record::new(value.clone()));
                }
                BatchAction::Delete => {
                    staged.remove(&key);
                }
            }
        }

        *data = staged;
        self.batches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, bucket: &str, key: &str) -> BoxFuture<'_, Option<Record>> {
        let key = (bucket.to_string(), key.to_string());
        Box::pin(async move {
            self.check_available("get")?;
            Ok(self.data.read().await.get(&key).cloned())
        })
    }

    fn put_batch(&self, ops: Vec<BatchOp>) -> BoxFuture<'_, ()> {
        Box::pin(self.apply(ops))
    }
}
