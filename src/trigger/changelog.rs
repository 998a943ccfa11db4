//! `changelog` trigger: appends every change to a log bucket.
//!
//! Keys are the zero-padded change number, so a lexical scan of the bucket
//! returns changes in source order.

use super::{Trigger, TriggerContext, TriggerFailure, TriggerSpec};
use crate::event::{ChangeEvent, OperationKind};
use crate::intent::WriteIntent;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangelogOptions {
    /// Prefix prepended to every key, e.g. one per source.
    #[serde(default)]
    key_prefix: String,
}

/// Appends one changelog-style record per change.
///
/// Keys are the zero-padded sequence number, so a lexical scan of the
/// bucket returns changes in order.
///
/// ```text
/// 00000000000000000042 → { "changenumber": 42, "changetype": "modify",
///                          "targetdn": "cn=a,dc=x", "changes": {...},
///                          "changetime": "..." }
/// ```
pub struct ChangelogTrigger {
    bucket: String,
    key_prefix: String,
}

impl ChangelogTrigger {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key_prefix: String::new(),
        }
    }

    pub fn from_spec(spec: &TriggerSpec) -> Result<Self, String> {
        let opts: ChangelogOptions = spec.parse_options()?;
        Ok(Self {
            bucket: spec.bucket().to_string(),
            key_prefix: opts.key_prefix,
        })
    }
}

impl Trigger for ChangelogTrigger {
    fn name(&self) -> &str {
        "changelog"
    }

    fn transform(&self, event: &ChangeEvent, _ctx: &TriggerContext) -> Result<Vec<WriteIntent>, TriggerFailure> {
        let mut doc = Map::new();
        doc.insert("changenumber".into(), json!(event.sequence_number));
        doc.insert("changetype".into(), json!(event.operation.as_str()));
        doc.insert("targetdn".into(), json!(event.target_id));
        if event.operation != OperationKind::Delete {
            doc.insert("changes".into(), json!(event.attributes));
        }
        if let Some(t) = event.change_time() {
            doc.insert("changetime".into(), json!(t));
        }

        let key = format!("{}{:020}", self.key_prefix, event.sequence_number);
        Ok(vec![WriteIntent::put(&self.bucket, key, Value::Object(doc))])
    }
}
