//! Change events and control metadata extraction.
//!
//! A [`ChangeEvent`] is one entry of the source directory's change log. The
//! feed adapters hand over the raw attribute changes plus the out-of-band
//! metadata the directory attached to the change (entry DN and the list of
//! protocol controls). [`extract_change_control`] is the one place that
//! digs the sequence number and operation kind out of that metadata.
//!
//! # Metadata Layout
//!
//! ```text
//! {
//!   "dn": "cn=alice,ou=people,dc=example,dc=com",
//!   "controls": [
//!     { "type": "2.16.840.1.113730.3.4.7",
//!       "value": { "changeType": 4, "changeNumber": 42 } }
//!   ],
//!   "changetime": "2026-01-02T03:04:05Z"
//! }
//! ```

use crate::error::SourceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// OID of the Entry Change Notification control.
pub const ENTRY_CHANGE_CONTROL_OID: &str = "2.16.840.1.113730.3.4.7";

/// Ordered attribute name to value list mapping.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Kind of directory mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Add,
    Modify,
    Delete,
}

impl OperationKind {
    /// Map the Entry Change Notification `changeType` bit value.
    ///
    /// `modDN` (8) is not replicated: a rename would need the previous DN
    /// resolved against destination state, which the feed cannot guarantee.
    pub fn from_change_type(change_type: u64) -> Option<Self> {
        match change_type {
            1 => Some(Self::Add),
            2 => Some(Self::Delete),
            4 => Some(Self::Modify),
            _ => None,
        }
    }

    /// Inverse of [`from_change_type`](Self::from_change_type).
    pub fn change_type(&self) -> u64 {
        match self {
            Self::Add => 1,
            Self::Delete => 2,
            Self::Modify => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change read from the source feed. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence_number: u64,
    pub operation: OperationKind,
    /// Normalized DN of the changed entry.
    pub target_id: String,
    /// For `Add`: full entry. For `Modify`: replacement values per listed
    /// attribute, an empty list removes the attribute. Empty for `Delete`.
    pub attributes: Attributes,
    pub source_metadata: Map<String, Value>,
}

impl ChangeEvent {
    /// Build an event from raw attribute changes and directory metadata.
    pub fn from_metadata(
        attributes: Attributes,
        source_metadata: Map<String, Value>,
    ) -> Result<Self, SourceError> {
        let control = extract_change_control(&source_metadata)?;
        Ok(Self {
            sequence_number: control.sequence_number,
            operation: control.operation,
            target_id: control.target_id,
            attributes,
            source_metadata,
        })
    }

    /// Source-side change timestamp, when the directory supplied one.
    pub fn change_time(&self) -> Option<&str> {
        self.source_metadata.get("changetime").and_then(Value::as_str)
    }
}

/// Metadata carrying an Entry Change Notification control, as a directory
/// attaches it to a persistent search result.
pub fn entry_change_metadata(dn: &str, sequence_number: u64, operation: OperationKind) -> Map<String, Value> {
    let control = json!({
        "type": ENTRY_CHANGE_CONTROL_OID,
        "value": {
            "changeType": operation.change_type(),
            "changeNumber": sequence_number,
        }
    });

    let mut metadata = Map::new();
    metadata.insert("dn".into(), Value::String(dn.to_string()));
    metadata.insert("controls".into(), Value::Array(vec![control]));
    metadata
}

/// Typed view of the control metadata attached to a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeControl {
    pub target_id: String,
    pub sequence_number: u64,
    pub operation: OperationKind,
}

/// Extract `{target, sequence number, kind}` from change metadata.
pub fn extract_change_control(metadata: &Map<String, Value>) -> Result<ChangeControl, SourceError> {
    let controls = metadata
        .get("controls")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::malformed(None, "change carries no controls"))?;

    let ecn = controls
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(ENTRY_CHANGE_CONTROL_OID))
        .and_then(|c| c.get("value"))
        .ok_or_else(|| SourceError::malformed(None, "entry change notification control missing"))?;

    let sequence_number = ecn
        .get("changeNumber")
        .and_then(as_u64_lenient)
        .ok_or_else(|| SourceError::malformed(None, "changeNumber missing or not an integer"))?;

    let change_type = ecn
        .get("changeType")
        .and_then(as_u64_lenient)
        .ok_or_else(|| SourceError::malformed(Some(sequence_number), "changeType missing"))?;

    let operation = OperationKind::from_change_type(change_type).ok_or_else(|| {
        SourceError::malformed(
            Some(sequence_number),
            format!("unsupported changeType {change_type}"),
        )
    })?;

    let dn = metadata
        .get("dn")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::malformed(Some(sequence_number), "dn missing"))?;

    let target_id = normalize_dn(dn).map_err(|e| SourceError::malformed(Some(sequence_number), e))?;
    if target_id.is_empty() {
        return Err(SourceError::malformed(Some(sequence_number), "change targets the empty DN"));
    }

    Ok(ChangeControl {
        target_id,
        sequence_number,
        operation,
    })
}

fn as_u64_lenient(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Split a DN into RDNs on unescaped commas.
fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&dn[start..]);
    parts
}

/// Canonical form of a DN: lowercased, no padding around `,` and `=`.
///
/// The empty DN is the root and normalizes to itself.
pub fn normalize_dn(dn: &str) -> Result<String, String> {
    let dn = dn.trim();
    if dn.is_empty() {
        return Ok(String::new());
    }

    let mut rdns = Vec::new();
    for rdn in split_rdns(dn) {
        let (attr, value) = rdn
            .split_once('=')
            .ok_or_else(|| format!("invalid RDN '{}' in '{}'", rdn.trim(), dn))?;
        let (attr, value) = (attr.trim(), value.trim());
        if attr.is_empty() || value.is_empty() {
            return Err(format!("invalid RDN '{}' in '{}'", rdn.trim(), dn));
        }
        rdns.push(format!("{}={}", attr.to_lowercase(), value.to_lowercase()));
    }
    Ok(rdns.join(","))
}

/// Search scope of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Only the base entry itself.
    Base,
    /// Direct children of the base.
    One,
    /// The base and everything below it.
    #[default]
    Sub,
}

/// Whether a normalized `dn` falls under normalized `base` for `scope`.
pub fn dn_in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let depth = |s: &str| if s.is_empty() { 0 } else { split_rdns(s).len() };

    let under_base = if base.is_empty() {
        true
    } else {
        dn == base || dn.ends_with(&format!(",{base}"))
    };
    if !under_base {
        return false;
    }

    match scope {
        SearchScope::Base => dn == base,
        SearchScope::One => depth(dn) == depth(base) + 1,
        SearchScope::Sub => true,
    }
}
