//! Commit batching for a single stream.
//!
//! Events that passed the trigger pipeline are accumulated here and
//! committed together, as one atomic checkpoint proposal covering a
//! contiguous sequence range.
//!
//! ```text
//! event N ──▶ pipeline ──▶ CommitBatch ──┬──▶ size reached ──┐
//!                                        └──▶ linger elapsed ─┴──▶ propose_update(range, intents)
//! ```
//!
//! With `max_batch_events = 1` (the default) every event is its own
//! transaction. Ranges may include sequence numbers that produced no
//! intents (out-of-scope entries, no-op modifies); the checkpoint still
//! advances past them.

use crate::checkpoint::SequenceRange;
use crate::intent::WriteIntent;
use std::time::{Duration, Instant};

/// Batch sizing and timing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum events per commit.
    pub max_batch_events: usize,
    /// Maximum time the first event of a batch waits for company.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 1,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

impl BatchConfig {
    /// Small batches with a short linger, for tests.
    pub fn testing() -> Self {
        Self {
            max_batch_events: 4,
            max_batch_delay: Duration::from_millis(5),
        }
    }
}

/// Accumulated events awaiting commit.
#[derive(Debug, Default)]
pub struct CommitBatch {
    range: Option<SequenceRange>,
    intents: Vec<WriteIntent>,
    events: usize,
    started: Option<Instant>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one processed event. Sequence numbers must be increasing.
    pub fn push(&mut self, sequence_number: u64, intents: Vec<WriteIntent>) {
        self.range = Some(match self.range {
            None => {
                self.started = Some(Instant::now());
                SequenceRange::single(sequence_number)
            }
            Some(r) => SequenceRange::new(r.first, sequence_number),
        });
        self.intents.extend(intents);
        self.events += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }

    /// Number of events (not intents) in the batch.
    pub fn len(&self) -> usize {
        self.events
    }

    pub fn range(&self) -> Option<SequenceRange> {
        self.range
    }

    pub fn intents(&self) -> &[WriteIntent] {
        &self.intents
    }

    /// Size threshold reached.
    pub fn is_full(&self, config: &BatchConfig) -> bool {
        self.events >= config.max_batch_events.max(1)
    }

    /// Time left before the batch must be flushed. `None` when empty.
    pub fn remaining_linger(&self, config: &BatchConfig) -> Option<Duration> {
        self.started
            .map(|start| config.max_batch_delay.saturating_sub(start.elapsed()))
    }

    /// Drop everything (after commit or on resync).
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
