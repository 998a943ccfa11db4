//! Destination write intents.
//!
//! Triggers never touch the store. They describe what should happen as
//! [`WriteIntent`]s and the checkpoint store turns the whole batch into one
//! conditional `put_batch`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOp {
    /// Replace the record with `value`.
    Put,
    /// Remove the record. `value` is ignored.
    Delete,
    /// Read-then-conditional-write: fold `value` (an object) into the
    /// current record. A `null` field removes that field. Merging into a
    /// missing record starts from an empty object.
    Merge,
}

/// A proposed destination mutation, owned by one commit batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub op: IntentOp,
}

impl WriteIntent {
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value,
            op: IntentOp::Put,
        }
    }

    pub fn delete(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value: Value::Null,
            op: IntentOp::Delete,
        }
    }

    pub fn merge(bucket: impl Into<String>, key: impl Into<String>, patch: Value) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value: patch,
            op: IntentOp::Merge,
        }
    }
}

/// Apply a merge patch to a (possibly absent) current value.
///
/// Non-object patches replace the value outright.
pub fn apply_merge(current: Option<&Value>, patch: &Value) -> Value {
    let Value::Object(fields) = patch else {
        return patch.clone();
    };

    let mut base = match current {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    };
    for (k, v) in fields {
        if v.is_null() {
            base.remove(k);
        } else {
            base.insert(k.clone(), v.clone());
        }
    }
    Value::Object(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_into_existing() {
        let current = json!({"cn": ["alice"], "mail": ["a@x"], "title": ["eng"]});
        let patch = json!({"mail": ["alice@x"], "title": null});
        assert_eq!(
            apply_merge(Some(&current), &patch),
            json!({"cn": ["alice"], "mail": ["alice@x"]})
        );
    }

    #[test]
    fn test_merge_into_missing() {
        let patch = json!({"mail": ["a@x"], "gone": null});
        assert_eq!(apply_merge(None, &patch), json!({"mail": ["a@x"]}));
    }

    #[test]
    fn test_merge_non_object_replaces() {
        assert_eq!(apply_merge(Some(&json!({"a": 1})), &json!(5)), json!(5));
    }

    #[test]
    fn test_constructors() {
        let d = WriteIntent::delete("mirror", "cn=a");
        assert_eq!(d.op, IntentOp::Delete);
        assert!(d.value.is_null());
        let m = WriteIntent::merge("mirror", "cn=a", json!({}));
        assert_eq!(m.op, IntentOp::Merge);
    }
}
