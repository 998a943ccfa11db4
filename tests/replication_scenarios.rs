//! End-to-end replication scenarios over the in-memory feed and store.
//!
//! Every test drives real supervisors and consumers; only the directory and
//! the destination are simulated.
//!
//! Run with: cargo test --test replication_scenarios

mod common;

use common::*;
use directory_replicator::checkpoint::{CheckpointStore, SequenceRange, DEFAULT_CHECKPOINT_BUCKET};
use directory_replicator::circuit_breaker::CircuitConfig;
use directory_replicator::config::StreamConfig;
use directory_replicator::event::{Attributes, OperationKind};
use directory_replicator::feed::SourceQuery;
use directory_replicator::intent::WriteIntent;
use directory_replicator::store::MemoryStore;
use directory_replicator::supervisor::{ReplicationSupervisor, StreamHealth, SupervisorSettings};
use directory_replicator::trigger::{TriggerRegistry, TriggerSpec};
use directory_replicator::writer::{CommitOutcome, DestinationWriter};
use directory_replicator::ReplicationError;
use serde_json::json;
use std::sync::Arc;

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn add_modify_delete_leaves_no_record() {
    let h = Harness::new();
    let dn = person_dn("alice");
    h.feed.publish(1, OperationKind::Add, &dn, attrs(&[("cn", "alice"), ("sn", "a")])).await;
    h.feed.publish(2, OperationKind::Modify, &dn, attrs(&[("mail", "alice@example.com")])).await;
    h.feed.publish(3, OperationKind::Delete, &dn, Attributes::new()).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    h.wait_checkpoint("people", 3).await;

    assert!(h.store.bucket("mirror").await.is_empty());
    assert_eq!(h.feed.delivered().await, vec![1, 2, 3]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn modify_merges_into_mirrored_entry() {
    let h = Harness::new();
    let dn = person_dn("Bob");
    h.feed.publish(1, OperationKind::Add, &dn, attrs(&[("cn", "Bob"), ("title", "eng")])).await;
    h.feed
        .publish(2, OperationKind::Modify, &dn, attrs(&[("mail", "bob@example.com")]))
        .await;
    let mut removal = Attributes::new();
    removal.insert("title".into(), Vec::new());
    h.feed.publish(3, OperationKind::Modify, &dn, removal).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    h.wait_checkpoint("people", 3).await;

    let mirror = h.store.bucket("mirror").await;
    let record = &mirror["cn=bob,ou=people,dc=example,dc=com"];
    assert_eq!(record["cn"], json!(["Bob"]));
    assert_eq!(record["mail"], json!(["bob@example.com"]));
    assert!(record.get("title").is_none());
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn out_of_scope_changes_are_not_mirrored() {
    let h = Harness::new();
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;
    h.feed
        .publish(2, OperationKind::Add, "cn=printer,ou=devices,dc=example,dc=com", attrs(&[("cn", "printer")]))
        .await;
    h.feed.publish(3, OperationKind::Add, &person_dn("b"), attrs(&[("cn", "b")])).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    h.wait_checkpoint("people", 3).await;

    let mirror = h.store.bucket("mirror").await;
    assert_eq!(mirror.len(), 2);
    assert!(!mirror.keys().any(|k| k.contains("devices")));
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn mirror_and_changelog_commit_together() {
    let h = Harness::new();
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;
    h.feed.publish(2, OperationKind::Delete, &person_dn("a"), Attributes::new()).await;

    let stream = StreamConfig {
        consumer_id: "audit".into(),
        source_query: SourceQuery::subtree(BASE_DN),
        trigger_chain: vec![TriggerSpec::new("mirror", "mirror"), TriggerSpec::new("changelog", "changelog")],
    };
    h.supervisor.add_stream(stream).await.unwrap();
    h.wait_checkpoint("audit", 2).await;

    let changelog = h.store.bucket("changelog").await;
    let keys: Vec<&String> = changelog.keys().collect();
    assert_eq!(keys, vec!["00000000000000000001", "00000000000000000002"]);
    assert_eq!(changelog["00000000000000000002"]["changetype"], json!("delete"));
    assert!(h.store.bucket("mirror").await.is_empty());
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn streams_keep_independent_checkpoints() {
    let h = Harness::new();
    for seq in 1..=4 {
        h.feed
            .publish(seq, OperationKind::Add, &person_dn(&format!("u{seq}")), attrs(&[("cn", "u")]))
            .await;
    }

    h.supervisor.add_stream(mirror_stream("first")).await.unwrap();
    h.wait_checkpoint("first", 4).await;

    let second = StreamConfig {
        trigger_chain: vec![TriggerSpec::new("changelog", "second_log")],
        ..mirror_stream("second")
    };
    h.supervisor.add_stream(second).await.unwrap();
    h.wait_checkpoint("second", 4).await;

    assert_eq!(h.store.bucket("second_log").await.len(), 4);
    assert_eq!(h.checkpoint("first").await, Some(4));
    h.supervisor.shutdown().await;
}

// =============================================================================
// Crash and resume
// =============================================================================

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let store = Arc::new(MemoryStore::new());
    let h = Harness::with_store(store.clone());
    let dn = person_dn("carol");
    h.feed.publish(1, OperationKind::Add, &dn, attrs(&[("cn", "carol")])).await;
    h.feed.publish(2, OperationKind::Modify, &dn, attrs(&[("sn", "c")])).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    h.wait_checkpoint("people", 2).await;
    h.supervisor.shutdown().await;

    // the change lands while the replicator is down
    h.feed.publish(3, OperationKind::Modify, &dn, attrs(&[("x", "1")])).await;

    let restarted = ReplicationSupervisor::new(
        Arc::new(h.feed.clone()),
        store.clone(),
        TriggerRegistry::with_builtins(),
        SupervisorSettings::testing(),
    );
    restarted.add_stream(mirror_stream("people")).await.unwrap();
    wait_checkpoint(&store, "people", 3).await;

    assert_eq!(h.feed.subscriptions().await.last(), Some(&2));
    let mirror = store.bucket("mirror").await;
    assert_eq!(mirror["cn=carol,ou=people,dc=example,dc=com"]["x"], json!(["1"]));
    restarted.shutdown().await;
}

#[tokio::test]
async fn replayed_range_is_absorbed() {
    let store = Arc::new(MemoryStore::new());
    let writer = DestinationWriter::new(
        "people",
        CheckpointStore::new(store.clone(), DEFAULT_CHECKPOINT_BUCKET),
        CircuitConfig::testing(),
    );
    let intents = vec![WriteIntent::put("mirror", "cn=a", json!({"cn": ["a"]}))];

    let first = writer.commit(SequenceRange::single(1), &intents).await.unwrap();
    assert_eq!(first, CommitOutcome::Applied);

    let batches = store.batches_applied();
    let replay = writer.commit(SequenceRange::single(1), &intents).await.unwrap();
    assert_eq!(replay, CommitOutcome::AlreadyApplied { current: 1 });
    assert_eq!(store.batches_applied(), batches);
    assert_eq!(writer.checkpoint().await.unwrap(), 1);
}

#[tokio::test]
async fn crashed_batch_leaves_no_partial_state() {
    let store = Arc::new(MemoryStore::new());
    let writer = DestinationWriter::new(
        "people",
        CheckpointStore::new(store.clone(), DEFAULT_CHECKPOINT_BUCKET),
        CircuitConfig::testing(),
    );
    let intents = vec![
        WriteIntent::put("mirror", "cn=a", json!({"cn": ["a"]})),
        WriteIntent::put("changelog", "00000000000000000001", json!({"changenumber": 1})),
    ];

    store.crash_mid_batch(1);
    let err = writer.commit(SequenceRange::single(1), &intents).await.unwrap_err();
    assert!(err.is_transient());
    assert!(store.is_empty().await);
    assert_eq!(writer.checkpoint().await.unwrap(), 0);

    assert_eq!(
        writer.commit(SequenceRange::single(1), &intents).await.unwrap(),
        CommitOutcome::Applied
    );
    assert_eq!(store.bucket("mirror").await.len(), 1);
    assert_eq!(store.bucket("changelog").await.len(), 1);
    assert_eq!(writer.checkpoint().await.unwrap(), 1);
}

#[tokio::test]
async fn stream_recovers_from_crash_mid_commit() {
    let store = Arc::new(MemoryStore::new());
    store.crash_mid_batch(1);
    let h = Harness::with_store(store.clone());
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    h.wait_checkpoint("people", 1).await;

    assert_eq!(store.batches_rejected(), 1);
    assert_eq!(store.bucket("mirror").await.len(), 1);
    h.supervisor.shutdown().await;
}

// =============================================================================
// Fail closed
// =============================================================================

#[tokio::test]
async fn trigger_error_pauses_until_event_is_fixed() {
    let h = Harness::new();
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;
    // an add with no attributes cannot be mirrored
    h.feed.publish(2, OperationKind::Add, &person_dn("b"), Attributes::new()).await;
    h.feed.publish(3, OperationKind::Add, &person_dn("c"), attrs(&[("cn", "c")])).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    let health = h.wait_health("people", |s| matches!(s, StreamHealth::Paused { .. })).await;
    match health {
        StreamHealth::Paused { sequence_number, reason } => {
            assert_eq!(sequence_number, Some(2));
            assert!(reason.contains("mirror"), "reason: {reason}");
        }
        other => panic!("unexpected health {other:?}"),
    }
    assert_eq!(h.checkpoint("people").await, Some(1));
    assert_eq!(h.store.bucket("mirror").await.len(), 1);

    h.feed.publish(2, OperationKind::Add, &person_dn("b"), attrs(&[("cn", "b")])).await;
    h.supervisor.retry_stream("people").await.unwrap();
    h.wait_checkpoint("people", 3).await;

    assert_eq!(h.store.bucket("mirror").await.len(), 3);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn malformed_event_pauses_stream() {
    let h = Harness::new();
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;
    // no entry change control at all
    let mut metadata = serde_json::Map::new();
    metadata.insert("dn".into(), json!(person_dn("b")));
    h.feed.publish_raw(2, attrs(&[("cn", "b")]), metadata).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    let health = h.wait_health("people", |s| matches!(s, StreamHealth::Paused { .. })).await;

    assert!(matches!(
        health,
        StreamHealth::Paused {
            sequence_number: Some(2),
            ..
        }
    ));
    assert_eq!(h.checkpoint("people").await, Some(1));
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn trimmed_history_pauses_with_gap() {
    let h = Harness::new();
    for seq in 1..=5 {
        h.feed
            .publish(seq, OperationKind::Add, &person_dn(&format!("u{seq}")), attrs(&[("cn", "u")]))
            .await;
    }
    h.feed.trim_through(3).await;

    h.supervisor.add_stream(mirror_stream("people")).await.unwrap();
    let health = h.wait_health("people", |s| matches!(s, StreamHealth::Paused { .. })).await;

    match health {
        StreamHealth::Paused { sequence_number, reason } => {
            assert_eq!(sequence_number, Some(1));
            assert!(reason.contains('4'), "reason: {reason}");
        }
        other => panic!("unexpected health {other:?}"),
    }
    assert!(h.store.bucket("mirror").await.is_empty());
    assert_eq!(h.checkpoint("people").await, None);
    h.supervisor.shutdown().await;
}

// =============================================================================
// Supervision
// =============================================================================

#[tokio::test]
async fn health_check_reports_every_stream() {
    let h = Harness::new();
    h.feed.publish(1, OperationKind::Add, &person_dn("a"), attrs(&[("cn", "a")])).await;

    h.supervisor.add_stream(mirror_stream("good")).await.unwrap();
    let bad = StreamConfig {
        trigger_chain: vec![TriggerSpec::new("nope", "x")],
        ..mirror_stream("bad")
    };
    let err = h.supervisor.add_stream(bad).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Config(_)));

    h.wait_checkpoint("good", 1).await;
    h.wait_health("good", |s| *s == StreamHealth::Streaming).await;

    let report = h.supervisor.health_check().await;
    assert_eq!(report.streams_total, 2);
    assert_eq!(report.streams_streaming, 1);
    assert_eq!(report.streams_attention, 1);
    assert!(!report.healthy);
    assert!(matches!(
        h.supervisor.health_of("bad").await,
        Some(StreamHealth::Failed(_))
    ));

    h.supervisor.remove_stream("bad").await.unwrap();
    assert_eq!(h.supervisor.stream_ids().await, vec!["good".to_string()]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_all_streams() {
    let h = Harness::new();
    h.supervisor.add_stream(mirror_stream("one")).await.unwrap();
    h.supervisor.add_stream(mirror_stream("two")).await.unwrap();
    h.wait_health("one", |s| *s == StreamHealth::Streaming).await;
    let one = h.supervisor.watch_health("one").await.unwrap();
    let two = h.supervisor.watch_health("two").await.unwrap();

    h.supervisor.shutdown().await;

    assert_eq!(*one.borrow(), StreamHealth::Stopped);
    assert_eq!(*two.borrow(), StreamHealth::Stopped);
    assert!(h.supervisor.stream_ids().await.is_empty());
    assert!(matches!(
        h.supervisor.add_stream(mirror_stream("three")).await,
        Err(ReplicationError::Shutdown)
    ));
}
