// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are layered. The two external collaborators each get their own
//! enum ([`StoreError`] for the destination KV store, [`SourceError`] for the
//! change feed) and both fold into [`ReplicationError`], which is what the
//! consumer and supervisor reason about.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Consumer reaction |
//! |------------|-----------|-------------------|
//! | `TransientSource` | Yes | Backoff, reconnect from checkpoint |
//! | `TransientStore` | Yes | Backoff, reconnect from checkpoint |
//! | `Trigger` | No | Pause stream, surface to operator |
//! | `MalformedEvent` | No | Pause stream, surface to operator |
//! | `SequenceGap` | No | Pause stream, surface to operator |
//! | `Config` | No | Stream never starts (`Failed`) |
//! | `InvalidState` | No | Caller bug |
//! | `Shutdown` | No | Process is terminating |
//! | `Internal` | No | Bug, needs investigation |
//!
//! A checkpoint conflict is not an error. Replaying an already-applied
//! sequence number is the normal resume path and is reported as an outcome
//! value (see [`crate::checkpoint::ProposeOutcome`]).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised by a destination [`KvStore`](crate::store::KvStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable, busy or timed out. Nothing was applied.
    #[error("store unavailable ({operation}): {message}")]
    Unavailable { operation: String, message: String },

    /// A batch precondition did not hold. Nothing was applied.
    #[error("precondition failed for {bucket}/{key}")]
    PreconditionFailed { bucket: String, key: String },

    /// A stored record could not be decoded.
    #[error("corrupt record {bucket}/{key}: {message}")]
    Corrupt {
        bucket: String,
        key: String,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors raised by a [`ChangeFeed`](crate::feed::ChangeFeed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Network failure, timeout or dropped subscription.
    #[error("source unavailable ({operation}): {message}")]
    Unavailable { operation: String, message: String },

    /// The feed produced an entry that is not a valid change event.
    #[error("malformed change at seq {sequence_number:?}: {reason}")]
    Malformed {
        sequence_number: Option<u64>,
        reason: String,
    },

    /// The subscription query was rejected.
    #[error("invalid source query: {0}")]
    InvalidQuery(String),

    /// The source no longer retains the changes right after the checkpoint.
    #[error("change log gap: need seq {requested}, oldest retained is {oldest}")]
    Gap { requested: u64, oldest: u64 },
}

impl SourceError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn malformed(sequence_number: Option<u64>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            sequence_number,
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for SourceError {
    fn from(e: redis::RedisError) -> Self {
        Self::unavailable("redis", e.to_string())
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Change feed transport failure. Retried with backoff.
    #[error("Transient source error ({operation}): {message}")]
    TransientSource { operation: String, message: String },

    /// Destination store unavailable. Retried with backoff.
    #[error("Transient store error ({operation}): {message}")]
    TransientStore { operation: String, message: String },

    /// A trigger stage could not map a well-formed event.
    ///
    /// The event is not committed and the stream halts on it.
    #[error("Trigger error in stage {stage_id}: {reason}")]
    Trigger { stage_id: String, reason: String },

    /// The feed delivered something that is not a usable change event.
    #[error("Malformed event (seq {sequence_number:?}): {reason}")]
    MalformedEvent {
        sequence_number: Option<u64>,
        reason: String,
    },

    /// Resuming would skip changes the source has already discarded.
    #[error("Sequence gap: need {requested}, source starts at {oldest}")]
    SequenceGap { requested: u64, oldest: u64 },

    /// Invalid stream definition or settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    pub fn transient_store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn transient_source(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientSource {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientSource { .. } => true,
            Self::TransientStore { .. } => true,
            Self::Trigger { .. } => false,
            Self::MalformedEvent { .. } => false,
            Self::SequenceGap { .. } => false, // data loss risk
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Io(_) => false,
            Self::Yaml(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Errors that halt a stream until an operator intervenes.
    pub fn pauses_stream(&self) -> bool {
        matches!(
            self,
            Self::Trigger { .. } | Self::MalformedEvent { .. } | Self::SequenceGap { .. }
        )
    }

    /// Sequence number the error is pinned to, when known.
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Self::MalformedEvent {
                sequence_number, ..
            } => *sequence_number,
            Self::SequenceGap { requested, .. } => Some(*requested),
            _ => None,
        }
    }
}

impl From<StoreError> for ReplicationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable { operation, message } => {
                Self::TransientStore { operation, message }
            }
            // Preconditions are resolved inside the checkpoint store; one
            // escaping means the retry budget ran out under contention.
            StoreError::PreconditionFailed { bucket, key } => Self::transient_store(
                "put_batch",
                format!("persistent precondition contention on {bucket}/{key}"),
            ),
            other @ StoreError::Corrupt { .. } => Self::Internal(other.to_string()),
        }
    }
}

impl From<SourceError> for ReplicationError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable { operation, message } => {
                Self::TransientSource { operation, message }
            }
            SourceError::Malformed {
                sequence_number,
                reason,
            } => Self::MalformedEvent {
                sequence_number,
                reason,
            },
            SourceError::InvalidQuery(msg) => Self::Config(msg),
            SourceError::Gap { requested, oldest } => Self::SequenceGap { requested, oldest },
        }
    }
}
