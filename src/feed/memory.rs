//! In-process change log.
//!
//! Entries are kept in a sequence-ordered map and delivered to every
//! subscription in order. Besides normal publishing it can simulate the
//! failure modes of a real directory feed:
//!
//! - [`fail_next_subscribes`](MemoryFeed::fail_next_subscribes): refuse
//!   the next N subscriptions (source down).
//! - [`disconnect_after`](MemoryFeed::disconnect_after): drop the next
//!   subscription after it delivered N events.
//! - [`trim_through`](MemoryFeed::trim_through): discard old changes, so a
//!   consumer behind them hits a gap.
//! - [`set_heartbeat_interval`](MemoryFeed::set_heartbeat_interval)`(None)`:
//!   go completely silent.
//!
//! Every subscription's start position and every delivered sequence number
//! are recorded for assertions.

use super::{BoxFuture, ChangeFeed, ChangeSubscription, FeedItem, ScopeMatcher, SourceQuery};
use crate::error::SourceError;
use crate::event::{entry_change_metadata, Attributes, ChangeEvent, OperationKind};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone)]
struct RawChange {
    attributes: Attributes,
    metadata: Map<String, Value>,
}

#[derive(Default)]
struct Log {
    entries: BTreeMap<u64, RawChange>,
    /// Highest sequence number discarded by trimming.
    trimmed_through: u64,
}

struct Inner {
    log: RwLock<Log>,
    notify: Notify,
    closed: AtomicBool,
    heartbeat: RwLock<Option<Duration>>,
    fail_subscribes: AtomicUsize,
    /// usize::MAX = disarmed
    disconnect_after: AtomicUsize,
    subscriptions: RwLock<Vec<u64>>,
    delivered: RwLock<Vec<u64>>,
}

/// Cloneable handle to a shared in-memory change log.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<Inner>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Log::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                heartbeat: RwLock::new(Some(Duration::from_secs(1))),
                fail_subscribes: AtomicUsize::new(0),
                disconnect_after: AtomicUsize::new(usize::MAX),
                subscriptions: RwLock::new(Vec::new()),
                delivered: RwLock::new(Vec::new()),
            }),
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Append a well-formed change. Re-publishing a sequence number replaces it.
    pub async fn publish(&self, seq: u64, operation: OperationKind, dn: &str, attributes: Attributes) {
        self.publish_raw(seq, attributes, entry_change_metadata(dn, seq, operation))
            .await;
    }

    /// Append a change with arbitrary metadata at log position `seq`.
    pub async fn publish_raw(&self, seq: u64, attributes: Attributes, metadata: Map<String, Value>) {
        self.inner
            .log
            .write()
            .await
            .entries
            .insert(seq, RawChange { attributes, metadata });
        self.inner.notify.notify_waiters();
    }

    /// Discard every change with sequence number `<= seq`.
    pub async fn trim_through(&self, seq: u64) {
        let mut log = self.inner.log.write().await;
        log.entries = log.entries.split_off(&(seq + 1));
        log.trimmed_through = log.trimmed_through.max(seq);
    }

    /// End all subscriptions once they drained the log.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.fail_subscribes.store(n, Ordering::SeqCst);
    }

    pub fn disconnect_after(&self, events: usize) {
        self.inner.disconnect_after.store(events, Ordering::SeqCst);
    }

    pub async fn set_heartbeat_interval(&self, interval: Option<Duration>) {
        *self.inner.heartbeat.write().await = interval;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// `after` position of every successful subscription, in order.
    pub async fn subscriptions(&self) -> Vec<u64> {
        self.inner.subscriptions.read().await.clone()
    }

    /// Sequence numbers handed to consumers, in delivery order.
    pub async fn delivered(&self) -> Vec<u64> {
        self.inner.delivered.read().await.clone()
    }

    pub async fn latest_sequence(&self) -> Option<u64> {
        self.inner.log.read().await.entries.keys().next_back().copied()
    }
}

impl ChangeFeed for MemoryFeed {
    fn name(&self) -> &str {
        "memory"
    }

    fn subscribe(&self, query: &SourceQuery, after: u64) -> BoxFuture<'_, Box<dyn ChangeSubscription>> {
        let matcher = query.matcher();
        Box::pin(async move {
            let matcher = matcher?;

            if self
                .inner
                .fail_subscribes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SourceError::unavailable("subscribe", "injected failure"));
            }

            {
                let log = self.inner.log.read().await;
                if log.trimmed_through > after {
                    let oldest = log
                        .entries
                        .keys()
                        .next()
                        .copied()
                        .unwrap_or(log.trimmed_through + 1);
                    return Err(SourceError::Gap {
                        requested: after + 1,
                        oldest,
                    });
                }
            }

            self.inner.subscriptions.write().await.push(after);
            let disconnect_after = self.inner.disconnect_after.swap(usize::MAX, Ordering::SeqCst);

            Ok(Box::new(MemorySubscription {
                inner: self.inner.clone(),
                matcher,
                cursor: after,
                remaining_before_disconnect: disconnect_after,
            }) as Box<dyn ChangeSubscription>)
        })
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    matcher: ScopeMatcher,
    cursor: u64,
    remaining_before_disconnect: usize,
}

impl MemorySubscription {
    async fn next(&mut self) -> Result<Option<FeedItem>, SourceError> {
        loop {
            if self.remaining_before_disconnect == 0 {
                return Err(SourceError::unavailable("next", "subscription dropped"));
            }

            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let log = self.inner.log.read().await;
                log.entries
                    .range((Bound::Excluded(self.cursor), Bound::Unbounded))
                    .next()
                    .map(|(seq, raw)| (*seq, raw.clone()))
            };

            if let Some((seq, raw)) = next {
                let event = match ChangeEvent::from_metadata(raw.attributes, raw.metadata) {
                    Ok(event) if event.sequence_number == seq => event,
                    Ok(event) => {
                        self.cursor = seq;
                        return Err(SourceError::malformed(
                            Some(seq),
                            format!("log position {seq} carries changeNumber {}", event.sequence_number),
                        ));
                    }
                    Err(SourceError::Malformed { reason, .. }) => {
                        self.cursor = seq;
                        return Err(SourceError::malformed(Some(seq), reason));
                    }
                    Err(e) => return Err(e),
                };

                if !self.matcher.matches(&event.target_id) {
                    self.cursor = seq;
                    continue;
                }

                // Cursor moves only once nothing awaits before the return;
                // a cancelled call must redeliver the same event.
                let mut delivered = self.inner.delivered.write().await;
                delivered.push(seq);
                self.cursor = seq;
                if self.remaining_before_disconnect != usize::MAX {
                    self.remaining_before_disconnect -= 1;
                }
                return Ok(Some(FeedItem::Event(event)));
            }

            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let heartbeat = *self.inner.heartbeat.read().await;
            match heartbeat {
                Some(interval) => {
                    if tokio::time::timeout(interval, notified).await.is_err() {
                        return Ok(Some(FeedItem::Heartbeat));
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl ChangeSubscription for MemorySubscription {
    fn next_item(&mut self) -> BoxFuture<'_, Option<FeedItem>> {
        Box::pin(self.next())
    }
}
