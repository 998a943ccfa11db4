//! Source change feed contract.
//!
//! A [`ChangeFeed`] hands out ordered [`ChangeSubscription`]s that start
//! strictly after a given sequence number. The consumer pulls one
//! [`FeedItem`] at a time. Heartbeats let it tell a quiet feed from a dead
//! one.
//!
//! # Backends
//!
//! - [`MemoryFeed`]: in-process change log with fault injection.
//! - [`RedisFeed`]: change log published to a Redis Stream, one entry per
//!   change with the change number as entry ID.
//!
//! Query filters are passed through untouched. Only the search base and
//! scope are enforced here; filter evaluation belongs to the directory.

pub mod memory;
pub mod redis;

pub use memory::MemoryFeed;
pub use redis::RedisFeed;

use crate::error::SourceError;
use crate::event::{dn_in_scope, normalize_dn, ChangeEvent, SearchScope};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future type for object-safe async feed methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

fn default_filter() -> String {
    "(objectClass=*)".to_string()
}

/// Per-stream subscription spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    /// Search base. Empty means the whole tree.
    pub base_dn: String,
    #[serde(default)]
    pub scope: SearchScope,
    /// Directory filter string, e.g. `(objectClass=person)`.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl SourceQuery {
    pub fn subtree(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: SearchScope::Sub,
            filter: default_filter(),
        }
    }

    /// Structural check of base DN and filter.
    pub fn validate(&self) -> Result<(), SourceError> {
        normalize_dn(&self.base_dn).map_err(SourceError::InvalidQuery)?;
        validate_filter(&self.filter).map_err(SourceError::InvalidQuery)
    }

    /// Scope matcher bound to the normalized base.
    pub fn matcher(&self) -> Result<ScopeMatcher, SourceError> {
        self.validate()?;
        Ok(ScopeMatcher {
            base: normalize_dn(&self.base_dn).map_err(SourceError::InvalidQuery)?,
            scope: self.scope,
        })
    }
}

/// Parenthesized and balanced, nothing outside the outer pair.
fn validate_filter(filter: &str) -> Result<(), String> {
    let f = filter.trim();
    if !f.starts_with('(') || !f.ends_with(')') {
        return Err(format!("filter '{filter}' must be parenthesized"));
    }

    let mut depth: i64 = 0;
    let mut escaped = false;
    for (i, c) in f.char_indices() {
        match c {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '(' if !escaped => depth += 1,
            ')' if !escaped => {
                depth -= 1;
                if depth < 0 || (depth == 0 && i + 1 != f.len()) {
                    return Err(format!("unbalanced filter '{filter}'"));
                }
            }
            _ => {}
        }
        escaped = false;
    }

    if depth != 0 {
        return Err(format!("unbalanced filter '{filter}'"));
    }
    if f == "()" {
        return Err("empty filter".to_string());
    }
    Ok(())
}

/// Client-side search scope test.
#[derive(Debug, Clone)]
pub struct ScopeMatcher {
    base: String,
    scope: SearchScope,
}

impl ScopeMatcher {
    pub fn matches(&self, target_id: &str) -> bool {
        dn_in_scope(target_id, &self.base, self.scope)
    }
}

/// One item pulled from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(ChangeEvent),
    /// Liveness signal while no change is pending.
    Heartbeat,
}

/// An ordered stream of changes.
pub trait ChangeSubscription: Send {
    /// Next item in sequence order. `Ok(None)` means the feed ended.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing.
    fn next_item(&mut self) -> BoxFuture<'_, Option<FeedItem>>;
}

/// Source of change subscriptions.
pub trait ChangeFeed: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Subscribe to changes matching `query` with sequence number `> after`.
    ///
    /// Fails with [`SourceError::Gap`] if the source no longer retains
    /// `after + 1`.
    fn subscribe(&self, query: &SourceQuery, after: u64) -> BoxFuture<'_, Box<dyn ChangeSubscription>>;
}
