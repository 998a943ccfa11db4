//! Trigger pipeline: pure transforms from change events to write intents.
//!
//! A stream's trigger chain is an ordered list of [`Trigger`] stages. For
//! each event every stage runs in order and the intents they return are
//! concatenated. Stages see the event and their own static configuration,
//! nothing else: the whole batch is known before anything is written.
//!
//! # Configuration
//!
//! ```yaml
//! trigger_chain:
//!   - kind: mirror
//!     bucket: people
//!     options:
//!       attributes: [cn, mail, sn]
//!   - kind: changelog
//!     bucket: changelog
//! ```
//!
//! Stages are instantiated by name through a [`TriggerRegistry`]. Unknown
//! names and invalid options are configuration errors, caught before the
//! stream starts.

mod changelog;
mod mirror;

pub use changelog::ChangelogTrigger;
pub use mirror::MirrorTrigger;

use crate::error::ReplicationError;
use crate::event::ChangeEvent;
use crate::intent::WriteIntent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Why a stage could not map an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TriggerFailure(pub String);

impl TriggerFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Static per-stream context handed to every stage.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub consumer_id: String,
}

/// One transform stage.
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Map one event to zero or more intents.
    ///
    /// Must not read or write the destination. State-dependent updates are
    /// expressed as [`IntentOp::Merge`](crate::intent::IntentOp::Merge).
    fn transform(&self, event: &ChangeEvent, ctx: &TriggerContext) -> Result<Vec<WriteIntent>, TriggerFailure>;
}

/// Configured reference to a trigger kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Registered trigger name, e.g. `mirror`.
    pub kind: String,
    /// Destination bucket. Defaults to the kind name.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Kind-specific options.
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl TriggerSpec {
    pub fn new(kind: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            bucket: Some(bucket.into()),
            options: Map::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_deref().unwrap_or(&self.kind)
    }

    /// Parse `options` into a kind-specific struct.
    pub fn parse_options<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.options.clone()))
            .map_err(|e| format!("invalid options for trigger '{}': {e}", self.kind))
    }
}

/// Ordered, immutable chain of stages for one stream.
pub struct TriggerPipeline {
    stages: Vec<Arc<dyn Trigger>>,
    ctx: TriggerContext,
}

impl TriggerPipeline {
    pub fn new(consumer_id: impl Into<String>, stages: Vec<Arc<dyn Trigger>>) -> Self {
        Self {
            stages,
            ctx: TriggerContext {
                consumer_id: consumer_id.into(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage on `event` and concatenate their intents.
    ///
    /// The first failing stage aborts the event with
    /// [`ReplicationError::Trigger`]; its id is `"{index}:{name}"`.
    pub fn apply(&self, event: &ChangeEvent) -> Result<Vec<WriteIntent>, ReplicationError> {
        let mut intents = Vec::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            let out = stage.transform(event, &self.ctx).map_err(|e| ReplicationError::Trigger {
                stage_id: format!("{idx}:{}", stage.name()),
                reason: e.0,
            })?;
            intents.extend(out);
        }
        Ok(intents)
    }
}

type TriggerFactory = dyn Fn(&TriggerSpec) -> Result<Arc<dyn Trigger>, String> + Send + Sync;

/// Name → factory lookup for trigger kinds.
#[derive(Clone)]
pub struct TriggerRegistry {
    factories: BTreeMap<String, Arc<TriggerFactory>>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TriggerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `mirror` and `changelog`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("mirror", |spec| Ok(Arc::new(MirrorTrigger::from_spec(spec)?) as Arc<dyn Trigger>));
        registry.register("changelog", |spec| {
            Ok(Arc::new(ChangelogTrigger::from_spec(spec)?) as Arc<dyn Trigger>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&TriggerSpec) -> Result<Arc<dyn Trigger>, String> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate a stream's chain.
    pub fn build(&self, consumer_id: &str, chain: &[TriggerSpec]) -> Result<TriggerPipeline, ReplicationError> {
        if chain.is_empty() {
            return Err(ReplicationError::Config(format!(
                "stream '{consumer_id}' has an empty trigger chain"
            )));
        }

        let stages = chain
            .iter()
            .map(|spec| {
                let factory = self.factories.get(&spec.kind).ok_or_else(|| {
                    ReplicationError::Config(format!(
                        "stream '{consumer_id}': unknown trigger '{}'",
                        spec.kind
                    ))
                })?;
                factory(spec).map_err(|e| ReplicationError::Config(format!("stream '{consumer_id}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TriggerPipeline::new(consumer_id, stages))
    }
}
