//! # Directory Replicator
//!
//! Replicates the change log of a directory service into a key-value
//! store, applying every change exactly once and resuming after a crash
//! from the last durably recorded position.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          directory-replicator                            │
//! │                                                                          │
//! │  ┌────────────┐   ┌────────────────┐   ┌─────────────────┐               │
//! │  │ ChangeFeed │──►│ ChangeConsumer │──►│ TriggerPipeline │               │
//! │  │ (per query)│   │ (per stream)   │   │ (pure stages)   │               │
//! │  └────────────┘   └────────────────┘   └─────────────────┘               │
//! │                           │                     │ WriteIntents            │
//! │                           ▼                     ▼                         │
//! │                   ┌──────────────────────────────────────┐               │
//! │                   │ DestinationWriter → CheckpointStore  │               │
//! │                   │ one atomic put_batch: intents +      │──► KvStore    │
//! │                   │ checkpoint advance                   │               │
//! │                   └──────────────────────────────────────┘               │
//! │                                                                          │
//! │  ReplicationSupervisor: owns the consumers, reports StreamHealth         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! For every stream, the destination reflects exactly the changes with
//! sequence number `<= checkpoint`. The checkpoint only moves inside the
//! same atomic batch as the writes it covers, and only forward, so
//! redelivered changes are absorbed as replays instead of being applied
//! twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use directory_replicator::config::StreamConfig;
//! use directory_replicator::feed::{MemoryFeed, SourceQuery};
//! use directory_replicator::store::MemoryStore;
//! use directory_replicator::supervisor::{ReplicationSupervisor, SupervisorSettings};
//! use directory_replicator::trigger::{TriggerRegistry, TriggerSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let supervisor = ReplicationSupervisor::new(
//!         Arc::new(MemoryFeed::new()),
//!         Arc::new(MemoryStore::new()),
//!         TriggerRegistry::with_builtins(),
//!         SupervisorSettings::default(),
//!     );
//!
//!     supervisor
//!         .add_stream(StreamConfig {
//!             consumer_id: "people".into(),
//!             source_query: SourceQuery::subtree("ou=people,dc=example,dc=com"),
//!             trigger_chain: vec![TriggerSpec::new("mirror", "people")],
//!         })
//!         .await
//!         .expect("invalid stream");
//!
//!     supervisor.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod feed;
pub mod intent;
pub mod metrics;
pub mod resilience;
pub mod store;
pub mod supervisor;
pub mod trigger;
pub mod writer;

// Re-exports for convenience
pub use checkpoint::{CheckpointRecord, CheckpointStore, ProposeOutcome, SequenceRange};
pub use config::{ReplicatorConfig, StreamConfig};
pub use consumer::{ChangeConsumer, ConsumerSettings};
pub use error::{ReplicationError, Result, SourceError, StoreError};
pub use event::{ChangeEvent, OperationKind};
pub use feed::{ChangeFeed, SourceQuery};
pub use intent::{IntentOp, WriteIntent};
pub use store::KvStore;
pub use supervisor::{HealthCheck, ReplicationSupervisor, StreamHealth, SupervisorSettings};
pub use trigger::{Trigger, TriggerPipeline, TriggerRegistry, TriggerSpec};
pub use writer::{CommitOutcome, DestinationWriter};
