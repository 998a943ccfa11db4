//! Destination writer: the only path by which destination state changes.
//!
//! [`DestinationWriter::commit`] hands a batch of intents and its sequence
//! range to [`CheckpointStore::propose_update`] behind a circuit breaker
//! and folds the result into what the consumer needs to decide its next
//! step.

use crate::checkpoint::{CheckpointStore, ProposeOutcome, SequenceRange};
use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::error::StoreError;
use crate::intent::WriteIntent;
use crate::metrics;
use std::time::Instant;
use tracing::{debug, info};

/// Result of a commit attempt that reached a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Writes and checkpoint are durable.
    Applied,
    /// The checkpoint already covers this range (replay). Treat as success.
    AlreadyApplied { current: u64 },
    /// The checkpoint sits inside the range: part of it was applied by a
    /// previous session with different batching. The consumer must resume
    /// from `current` instead.
    Overlap { current: u64 },
}

pub struct DestinationWriter {
    consumer_id: String,
    checkpoints: CheckpointStore,
    circuit: CircuitBreaker,
}

impl DestinationWriter {
    pub fn new(consumer_id: impl Into<String>, checkpoints: CheckpointStore, circuit: CircuitConfig) -> Self {
        let consumer_id = consumer_id.into();
        Self {
            circuit: CircuitBreaker::new(format!("commit:{consumer_id}"), circuit),
            consumer_id,
            checkpoints,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Last durably applied sequence number, 0 if none.
    pub async fn checkpoint(&self) -> Result<u64, StoreError> {
        Ok(self
            .checkpoints
            .get(&self.consumer_id)
            .await?
            .map(|r| r.last_sequence_number)
            .unwrap_or(0))
    }

    /// Atomically apply `intents` and advance the checkpoint to `range.last`.
    pub async fn commit(&self, range: SequenceRange, intents: &[WriteIntent]) -> Result<CommitOutcome, StoreError> {
        let start = Instant::now();
        let result = self
            .circuit
            .call(|| self.checkpoints.propose_update(&self.consumer_id, range, intents))
            .await;

        let outcome = match result {
            Ok(ProposeOutcome::Applied) => CommitOutcome::Applied,
            Ok(ProposeOutcome::Conflict { current }) if current >= range.last => {
                CommitOutcome::AlreadyApplied { current }
            }
            Ok(ProposeOutcome::Conflict { current }) => CommitOutcome::Overlap { current },
            Err(CircuitError::Rejected) => {
                metrics::record_commit(&self.consumer_id, "rejected", start.elapsed());
                return Err(StoreError::unavailable("commit", "circuit breaker open"));
            }
            Err(CircuitError::Inner(e)) => {
                metrics::record_commit(&self.consumer_id, "error", start.elapsed());
                return Err(e);
            }
        };

        match outcome {
            CommitOutcome::Applied => {
                metrics::record_commit(&self.consumer_id, "applied", start.elapsed());
                metrics::record_checkpoint(&self.consumer_id, range.last);
                debug!(
                    consumer_id = %self.consumer_id,
                    first = range.first,
                    last = range.last,
                    intents = intents.len(),
                    "Committed"
                );
            }
            CommitOutcome::AlreadyApplied { current } => {
                metrics::record_commit(&self.consumer_id, "already_applied", start.elapsed());
                debug!(consumer_id = %self.consumer_id, seq = range.last, current, "Replay absorbed");
            }
            CommitOutcome::Overlap { current } => {
                metrics::record_commit(&self.consumer_id, "overlap", start.elapsed());
                info!(
                    consumer_id = %self.consumer_id,
                    first = range.first,
                    last = range.last,
                    current,
                    "Batch overlaps checkpoint, resyncing"
                );
            }
        }
        Ok(outcome)
    }
}
