// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination key-value store contract.
//!
//! The replicator needs exactly two primitives from the destination:
//! a bucket-scoped `get` and an atomic, conditional `put_batch`. Everything
//! else (checkpoints, merge resolution, idempotent replay) is built on top of
//! those in [`crate::checkpoint`].
//!
//! # Backends
//!
//! | Backend | Atomicity | Use |
//! |---------|-----------|-----|
//! | [`MemoryStore`] | staged copy swapped under one lock | tests, fault injection |
//! | [`SqliteStore`] | one SQLite transaction | single-node deployments |
//! | [`RedisStore`] | one Lua script | shared destination |
//!
//! # Example
//!
//! ```rust,no_run
//! use directory_replicator::store::{BatchOp, KvStore, MemoryStore, Precondition};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), directory_replicator::error::StoreError> {
//! let store = MemoryStore::new();
//! store
//!     .put_batch(vec![BatchOp::put("mirror", "cn=a", json!({"cn": ["a"]}))
//!         .with_precondition(Precondition::Absent)])
//!     .await?;
//! let record = store.get("mirror", "cn=a").await?;
//! assert!(record.is_some());
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod redis;
pub mod sqlite;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future type for object-safe async store methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A stored value with its version tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub value: Value,
    pub etag: String,
}

impl Record {
    pub fn new(value: Value) -> Self {
        let etag = compute_etag(&value);
        Self { value, etag }
    }
}

/// Version tag of a value: hex SHA-256 of its JSON serialization.
///
/// `serde_json` keeps object keys sorted (no `preserve_order`), so equal
/// values always serialize identically.
pub fn compute_etag(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Condition that must hold on a key for its batch to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    None,
    /// Key must not exist.
    Absent,
    /// Key must exist with this etag.
    Etag(String),
}

impl Precondition {
    /// Precondition matching the observed state of a key.
    pub fn from_current(current: Option<&Record>) -> Self {
        match current {
            Some(r) => Self::Etag(r.etag.clone()),
            None => Self::Absent,
        }
    }

    /// Check against the current etag of a key (`None` = key absent).
    pub fn holds(&self, current_etag: Option<&str>) -> bool {
        match self {
            Self::None => true,
            Self::Absent => current_etag.is_none(),
            Self::Etag(expected) => current_etag == Some(expected.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchAction {
    Put(Value),
    Delete,
}

/// One conditional operation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOp {
    pub bucket: String,
    pub key: String,
    pub action: BatchAction,
    pub precondition: Precondition,
}

impl BatchOp {
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            action: BatchAction::Put(value),
            precondition: Precondition::None,
        }
    }

    pub fn delete(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            action: BatchAction::Delete,
            precondition: Precondition::None,
        }
    }

    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    fn precondition_failed(&self) -> StoreError {
        StoreError::PreconditionFailed {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
        }
    }
}

/// Destination key-value store.
///
/// Implementations must apply a `put_batch` atomically: either every
/// operation becomes visible to subsequent `get`s, or none does. If any
/// precondition fails the batch is rejected with
/// [`StoreError::PreconditionFailed`] and nothing changes. Callers must not
/// put the same `(bucket, key)` twice in one batch.
pub trait KvStore: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Read one key.
    fn get(&self, bucket: &str, key: &str) -> BoxFuture<'_, Option<Record>>;

    /// Apply a batch of conditional operations atomically.
    fn put_batch(&self, ops: Vec<BatchOp>) -> BoxFuture<'_, ()>;

    /// Flush and release backend resources once no stream writes anymore.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
