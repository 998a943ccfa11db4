//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use directory_replicator::batch::CommitBatch;
use directory_replicator::checkpoint::{CheckpointStore, SequenceRange, DEFAULT_CHECKPOINT_BUCKET};
use directory_replicator::circuit_breaker::CircuitConfig;
use directory_replicator::event::{dn_in_scope, normalize_dn, SearchScope};
use directory_replicator::feed::redis::{maybe_decompress, parse_change_id};
use directory_replicator::feed::SourceQuery;
use directory_replicator::intent::{apply_merge, WriteIntent};
use directory_replicator::store::MemoryStore;
use directory_replicator::writer::{CommitOutcome, DestinationWriter};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn rdn() -> impl Strategy<Value = String> {
    ("(cn|ou|dc|uid|CN|Ou)", "[A-Za-z0-9][A-Za-z0-9 _.-]{0,10}")
        .prop_map(|(attr, value)| format!("{attr}={}", value.trim_end()))
}

fn dn() -> impl Strategy<Value = String> {
    prop::collection::vec(rdn(), 1..5).prop_map(|rdns| rdns.join(","))
}

// =============================================================================
// DN Normalization Properties
// =============================================================================

proptest! {
    /// Normalizing twice changes nothing
    #[test]
    fn normalize_dn_idempotent(dn in dn()) {
        let once = normalize_dn(&dn).unwrap();
        prop_assert_eq!(normalize_dn(&once).unwrap(), once);
    }

    /// Case and padding around separators never matter
    #[test]
    fn normalize_dn_ignores_case_and_padding(dn in dn()) {
        let padded = dn.to_uppercase().replace(',', " , ").replace('=', " = ");
        prop_assert_eq!(normalize_dn(&padded).unwrap(), normalize_dn(&dn).unwrap());
    }

    /// A direct child is in one-level and subtree scope, never in base scope
    #[test]
    fn child_scope(base in dn(), child in rdn()) {
        let base = normalize_dn(&base).unwrap();
        let entry = normalize_dn(&format!("{child},{base}")).unwrap();

        prop_assert!(dn_in_scope(&entry, &base, SearchScope::Sub));
        prop_assert!(dn_in_scope(&entry, &base, SearchScope::One));
        prop_assert!(!dn_in_scope(&entry, &base, SearchScope::Base));
        prop_assert!(dn_in_scope(&base, &base, SearchScope::Base));
    }

    /// Balanced filters validate, a dangling paren never does
    #[test]
    fn filter_balance(attr in "[a-zA-Z]{1,8}", value in "[a-z0-9*]{1,8}", depth in 1usize..4) {
        let mut filter = format!("({attr}={value})");
        for _ in 1..depth {
            filter = format!("(&{filter}(objectClass=*))");
        }

        let mut query = SourceQuery::subtree("dc=example,dc=com");
        query.filter = filter.clone();
        prop_assert!(query.validate().is_ok());

        query.filter = format!("{filter})");
        prop_assert!(query.validate().is_err());
        query.filter = filter[..filter.len() - 1].to_string();
        prop_assert!(query.validate().is_err());
    }
}

// =============================================================================
// Payload Properties
// =============================================================================

proptest! {
    /// Change IDs carry the change number in the millisecond part
    #[test]
    fn change_id_parse(seq in 0u64..u64::MAX, n in 0u64..1000) {
        prop_assert_eq!(parse_change_id(&format!("{seq}-{n}")), Some(seq));
        prop_assert_eq!(parse_change_id(&seq.to_string()), Some(seq));
    }

    /// Garbage input never panics
    #[test]
    fn decompress_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = maybe_decompress(&data);
    }

    /// Applying the same merge patch twice equals applying it once
    #[test]
    fn merge_idempotent(
        current in prop::collection::btree_map("[a-e]", "[a-z]{0,4}", 0..5),
        patch in prop::collection::btree_map("[a-g]", prop::option::of("[a-z]{0,4}"), 0..5),
    ) {
        let current: Value = json!(current);
        let patch: Value = Value::Object(
            patch.into_iter().map(|(k, v)| (k, v.map(Value::from).unwrap_or(Value::Null))).collect(),
        );

        let once = apply_merge(Some(&current), &patch);
        let twice = apply_merge(Some(&once), &patch);
        prop_assert_eq!(&once, &twice);
        for (k, v) in patch.as_object().unwrap() {
            prop_assert_eq!(once.get(k), if v.is_null() { None } else { Some(v) });
        }
    }

    /// A batch covers exactly the sequence numbers pushed into it
    #[test]
    fn batch_range_covers_pushes(start in 1u64..1000, steps in prop::collection::vec(1u64..5, 1..20)) {
        let mut batch = CommitBatch::new();
        let mut seq = start;
        for (i, step) in steps.iter().enumerate() {
            if i > 0 {
                seq += step;
            }
            batch.push(seq, vec![WriteIntent::delete("b", seq.to_string())]);
        }

        prop_assert_eq!(batch.len(), steps.len());
        prop_assert_eq!(batch.intents().len(), steps.len());
        prop_assert_eq!(batch.range(), Some(SequenceRange::new(start, seq)));
    }
}

// =============================================================================
// Checkpoint Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The checkpoint never moves backwards, and a range is applied
    /// only if it lies entirely beyond it
    #[test]
    fn checkpoint_monotonic(ranges in prop::collection::vec((1u64..50, 0u64..5), 1..20)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let writer = DestinationWriter::new(
                "prop",
                CheckpointStore::new(store.clone(), DEFAULT_CHECKPOINT_BUCKET),
                CircuitConfig::default(),
            );

            let mut expected = 0u64;
            for (first, len) in ranges {
                let range = SequenceRange::new(first, first + len);
                let intents = vec![WriteIntent::put("b", first.to_string(), json!(range.last))];
                let outcome = writer.commit(range, &intents).await.unwrap();

                match outcome {
                    CommitOutcome::Applied => {
                        prop_assert!(range.first > expected);
                        expected = range.last;
                    }
                    CommitOutcome::AlreadyApplied { current } => {
                        prop_assert_eq!(current, expected);
                        prop_assert!(range.last <= expected);
                    }
                    CommitOutcome::Overlap { current } => {
                        prop_assert_eq!(current, expected);
                        prop_assert!(range.first <= expected && range.last > expected);
                    }
                }
                prop_assert_eq!(writer.checkpoint().await.unwrap(), expected);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
