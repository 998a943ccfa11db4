//! `mirror` trigger: keeps one destination record per directory entry.
//!
//! Adds become puts of the full attribute map, modifies become merge patches
//! (an empty value list removes the attribute) and deletes remove the record.
//! Records are keyed by normalized DN. The optional `attributes` allowlist
//! limits what is copied.

use super::{Trigger, TriggerContext, TriggerFailure, TriggerSpec};
use crate::event::{ChangeEvent, OperationKind};
use crate::intent::WriteIntent;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorOptions {
    /// Attribute allowlist (case-insensitive). Empty mirrors everything.
    #[serde(default)]
    attributes: Vec<String>,
}

/// Keeps one record per directory entry, keyed by normalized DN.
///
/// Add writes the full entry, Modify merges the changed attributes
/// (an empty value list removes the attribute), Delete removes the record.
/// Attribute names are lowercased.
pub struct MirrorTrigger {
    bucket: String,
    allow: BTreeSet<String>,
}

impl MirrorTrigger {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            allow: BTreeSet::new(),
        }
    }

    pub fn from_spec(spec: &TriggerSpec) -> Result<Self, String> {
        let opts: MirrorOptions = spec.parse_options()?;
        Ok(Self {
            bucket: spec.bucket().to_string(),
            allow: opts.attributes.iter().map(|a| a.to_lowercase()).collect(),
        })
    }

    fn mirrored<'a>(&'a self, event: &'a ChangeEvent) -> impl Iterator<Item = (String, &'a Vec<String>)> + 'a {
        event
            .attributes
            .iter()
            .map(|(name, values)| (name.to_lowercase(), values))
            .filter(move |(name, _)| self.allow.is_empty() || self.allow.contains(name))
    }
}

impl Trigger for MirrorTrigger {
    fn name(&self) -> &str {
        "mirror"
    }

    fn transform(&self, event: &ChangeEvent, _ctx: &TriggerContext) -> Result<Vec<WriteIntent>, TriggerFailure> {
        let key = event.target_id.as_str();
        if key.is_empty() {
            return Err(TriggerFailure::new("change targets the root DSE"));
        }

        match event.operation {
            OperationKind::Add => {
                if event.attributes.is_empty() {
                    return Err(TriggerFailure::new(format!("add of '{key}' carries no attributes")));
                }
                let doc: Map<String, Value> = self
                    .mirrored(event)
                    .filter(|(_, values)| !values.is_empty())
                    .map(|(name, values)| (name, Value::from(values.clone())))
                    .collect();
                Ok(vec![WriteIntent::put(&self.bucket, key, Value::Object(doc))])
            }
            OperationKind::Modify => {
                let patch: Map<String, Value> = self
                    .mirrored(event)
                    .map(|(name, values)| {
                        let v = if values.is_empty() { Value::Null } else { Value::from(values.clone()) };
                        (name, v)
                    })
                    .collect();
                if patch.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![WriteIntent::merge(&self.bucket, key, Value::Object(patch))])
            }
            OperationKind::Delete => Ok(vec![WriteIntent::delete(&self.bucket, key)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Attributes;
    use crate::intent::IntentOp;
    use serde_json::json;

    fn ctx() -> TriggerContext {
        TriggerContext {
            consumer_id: "c1".into(),
        }
    }

    fn event(op: OperationKind, attrs: &[(&str, &[&str])]) -> ChangeEvent {
        let attributes: Attributes = attrs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect();
        ChangeEvent {
            sequence_number: 1,
            operation: op,
            target_id: "cn=a,dc=x".into(),
            attributes,
            source_metadata: Map::new(),
        }
    }

    #[test]
    fn test_add_puts_lowercased_entry() {
        let t = MirrorTrigger::new("mirror");
        let out = t
            .transform(&event(OperationKind::Add, &[("CN", &["A"]), ("mail", &["a@x"])]), &ctx())
            .unwrap();
        assert_eq!(out, vec![WriteIntent::put("mirror", "cn=a,dc=x", json!({"cn": ["A"], "mail": ["a@x"]}))]);
    }

    #[test]
    fn test_modify_merges_and_removes() {
        let t = MirrorTrigger::new("mirror");
        let out = t
            .transform(&event(OperationKind::Modify, &[("mail", &["b@x"]), ("title", &[])]), &ctx())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, IntentOp::Merge);
        assert_eq!(out[0].value, json!({"mail": ["b@x"], "title": null}));
    }

    #[test]
    fn test_delete() {
        let t = MirrorTrigger::new("mirror");
        let out = t.transform(&event(OperationKind::Delete, &[]), &ctx()).unwrap();
        assert_eq!(out, vec![WriteIntent::delete("mirror", "cn=a,dc=x")]);
    }

    #[test]
    fn test_add_without_attributes_fails() {
        let t = MirrorTrigger::new("mirror");
        assert!(t.transform(&event(OperationKind::Add, &[]), &ctx()).is_err());
    }

    #[test]
    fn test_allowlist_filters() {
        let mut spec = TriggerSpec::new("mirror", "people");
        spec.options.insert("attributes".into(), json!(["Mail"]));
        let t = MirrorTrigger::from_spec(&spec).unwrap();

        let out = t
            .transform(&event(OperationKind::Add, &[("cn", &["a"]), ("mail", &["a@x"])]), &ctx())
            .unwrap();
        assert_eq!(out[0].bucket, "people");
        assert_eq!(out[0].value, json!({"mail": ["a@x"]}));

        // a modify touching only filtered attributes produces nothing
        let out = t.transform(&event(OperationKind::Modify, &[("cn", &["b"])]), &ctx()).unwrap();
        assert!(out.is_empty());
    }
}
