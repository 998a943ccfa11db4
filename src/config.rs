//! Configuration for the directory replicator.
//!
//! Configuration is loaded once at startup from YAML (hot reload is not
//! supported) and can also be built programmatically.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── settings: ReplicatorSettings
//! │   ├── checkpoint_bucket: String   # Where checkpoints live
//! │   ├── consumer: ConsumerConfig    # Heartbeat, batching, rate limit
//! │   ├── backoff: BackoffConfig      # Reconnect backoff
//! │   └── circuit: CircuitSettings    # Commit circuit breaker
//! ├── source: SourceConfig            # Change feed (redis | memory)
//! ├── destination: DestinationConfig  # KV store (sqlite | redis | memory)
//! └── streams: Vec<StreamConfig>      # One consumer per entry
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   consumer:
//!     heartbeat_timeout: "30s"
//!     max_batch_events: 1
//!   backoff:
//!     initial_delay: "1s"
//!     max_delay: "5m"
//!
//! source:
//!   type: redis
//!   url: "redis://directory-cdc:6379"
//!   stream_key: "directory:changes"
//!
//! destination:
//!   type: sqlite
//!   path: "/var/lib/replicator/store.db"
//!
//! streams:
//!   - consumer_id: "people"
//!     source_query:
//!       base_dn: "ou=people,dc=example,dc=com"
//!       scope: sub
//!       filter: "(objectClass=person)"
//!     trigger_chain:
//!       - kind: mirror
//!         bucket: people
//!       - kind: changelog
//!         bucket: changelog
//! ```

use crate::batch::BatchConfig;
use crate::checkpoint::DEFAULT_CHECKPOINT_BUCKET;
use crate::circuit_breaker::CircuitConfig;
use crate::connection::RedisConnector;
use crate::consumer::ConsumerSettings;
use crate::error::{ReplicationError, Result};
use crate::feed::{ChangeFeed, MemoryFeed, RedisFeed, SourceQuery};
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::store::{KvStore, MemoryStore, RedisStore, SqliteStore};
use crate::supervisor::SupervisorSettings;
use crate::trigger::TriggerSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub settings: ReplicatorSettings,

    pub source: SourceConfig,

    pub destination: DestinationConfig,

    /// Stream definitions, started in order.
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl ReplicatorConfig {
    /// Read and parse a YAML file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// In-memory source and destination, for tests.
    pub fn for_testing() -> Self {
        Self {
            settings: ReplicatorSettings::default(),
            source: SourceConfig::Memory,
            destination: DestinationConfig::Memory,
            streams: Vec::new(),
        }
    }

    /// Check everything that can be checked without connecting.
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        self.source.validate(self.settings.consumer.heartbeat_timeout_duration())?;
        self.destination.validate()?;

        let mut seen = BTreeSet::new();
        for stream in &self.streams {
            stream.validate(&self.settings.checkpoint_bucket)?;
            if !seen.insert(stream.consumer_id.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "duplicate stream consumer_id '{}'",
                    stream.consumer_id
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    /// Bucket holding one checkpoint record per stream.
    #[serde(default = "default_checkpoint_bucket")]
    pub checkpoint_bucket: String,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub circuit: CircuitSettings,

    /// How often the binary logs a health summary.
    #[serde(default = "default_health_log_interval")]
    pub health_log_interval: String,

    /// How long shutdown waits for each stream's in-flight commit.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_checkpoint_bucket() -> String {
    DEFAULT_CHECKPOINT_BUCKET.to_string()
}

fn default_health_log_interval() -> String {
    "60s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            checkpoint_bucket: default_checkpoint_bucket(),
            consumer: ConsumerConfig::default(),
            backoff: BackoffConfig::default(),
            circuit: CircuitSettings::default(),
            health_log_interval: default_health_log_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReplicatorSettings {
    pub fn health_log_interval_duration(&self) -> Duration {
        parse_or(&self.health_log_interval, Duration::from_secs(60))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }

    fn validate(&self) -> Result<()> {
        if self.checkpoint_bucket.trim().is_empty() {
            return Err(ReplicationError::Config("checkpoint_bucket must not be empty".into()));
        }
        check_duration("settings.health_log_interval", &self.health_log_interval)?;
        check_duration("settings.drain_timeout", &self.drain_timeout)?;
        self.consumer.validate()?;
        self.backoff.validate()?;
        self.circuit.validate()
    }

    /// Everything a supervisor needs.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            checkpoint_bucket: self.checkpoint_bucket.clone(),
            consumer: ConsumerSettings {
                heartbeat_timeout: self.consumer.heartbeat_timeout_duration(),
                batch: self.consumer.batch_config(),
                retry: self.backoff.retry_config(),
                rate_limit: self.consumer.rate_limit_config(),
            },
            circuit: self.circuit.circuit_config(),
            drain_timeout: self.drain_timeout_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// No feed item (event or heartbeat) for this long = transient failure.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: String,

    /// Events committed together as one atomic range. 1 = one commit per event.
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// Maximum time a partial batch waits before commit.
    #[serde(default = "default_batch_linger")]
    pub batch_linger: String,

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained events per second per stream.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_heartbeat_timeout() -> String {
    "30s".to_string()
}

fn default_max_batch_events() -> usize {
    1
}

fn default_batch_linger() -> String {
    "50ms".to_string()
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            max_batch_events: default_max_batch_events(),
            batch_linger: default_batch_linger(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ConsumerConfig {
    pub fn heartbeat_timeout_duration(&self) -> Duration {
        parse_or(&self.heartbeat_timeout, Duration::from_secs(30))
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_events: self.max_batch_events.max(1),
            max_batch_delay: parse_or(&self.batch_linger, Duration::from_millis(50)),
        }
    }

    /// `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }

    fn validate(&self) -> Result<()> {
        check_duration("consumer.heartbeat_timeout", &self.heartbeat_timeout)?;
        check_duration("consumer.batch_linger", &self.batch_linger)?;
        if self.max_batch_events == 0 {
            return Err(ReplicationError::Config("consumer.max_batch_events must be at least 1".into()));
        }
        if self.rate_limit_enabled && (self.rate_limit_per_sec == 0 || self.rate_limit_burst == 0) {
            return Err(ReplicationError::Config("rate limit values must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackoffConfig / CircuitSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconnect backoff: `initial_delay * backoff_factor^(attempt-1)`, capped, jittered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Random spread, as a fraction of the delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Timeout for one connection attempt to a Redis backend.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_connection_timeout() -> String {
    "30s".to_string()
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter_factor: default_jitter_factor(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl BackoffConfig {
    pub fn retry_config(&self) -> RetryConfig {
        let daemon = RetryConfig::daemon();
        RetryConfig {
            initial_delay: parse_or(&self.initial_delay, daemon.initial_delay),
            max_delay: parse_or(&self.max_delay, daemon.max_delay),
            backoff_factor: self.backoff_factor,
            jitter_factor: self.jitter_factor,
            connection_timeout: parse_or(&self.connection_timeout, daemon.connection_timeout),
            ..daemon
        }
    }

    fn validate(&self) -> Result<()> {
        let initial = check_duration("backoff.initial_delay", &self.initial_delay)?;
        let max = check_duration("backoff.max_delay", &self.max_delay)?;
        check_duration("backoff.connection_timeout", &self.connection_timeout)?;
        if initial > max {
            return Err(ReplicationError::Config(
                "backoff.initial_delay must not exceed backoff.max_delay".into(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ReplicationError::Config("backoff.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ReplicationError::Config("backoff.jitter_factor must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

/// Circuit breaker around destination commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: parse_or(&self.recovery_timeout, Duration::from_secs(30)),
        }
    }

    fn validate(&self) -> Result<()> {
        check_duration("circuit.recovery_timeout", &self.recovery_timeout)?;
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ReplicationError::Config("circuit thresholds must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source / destination
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Change log published to a Redis Stream.
    Redis {
        url: String,
        #[serde(default = "default_stream_key")]
        stream_key: String,
        /// XREAD block time; an idle read yields a heartbeat.
        #[serde(default = "default_block_timeout")]
        block_timeout: String,
        /// Entries per XREAD.
        #[serde(default = "default_read_batch_size")]
        batch_size: usize,
    },
    /// Empty in-process log (dry runs and tests).
    Memory,
}

fn default_stream_key() -> String {
    "directory:changes".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_read_batch_size() -> usize {
    100
}

impl SourceConfig {
    /// An idle read must return before the consumer gives up on the feed.
    fn validate(&self, heartbeat_timeout: Duration) -> Result<()> {
        if let SourceConfig::Redis {
            url,
            stream_key,
            block_timeout,
            ..
        } = self
        {
            if url.is_empty() || stream_key.is_empty() {
                return Err(ReplicationError::Config("source url and stream_key are required".into()));
            }
            let block = check_duration("source.block_timeout", block_timeout)?;
            if block >= heartbeat_timeout {
                return Err(ReplicationError::Config(format!(
                    "source.block_timeout ({block_timeout}) must be shorter than settings.consumer.heartbeat_timeout ({})",
                    humantime::format_duration(heartbeat_timeout)
                )));
            }
        }
        Ok(())
    }

    /// Build the feed. Redis connects lazily.
    pub fn build(&self, retry: &RetryConfig) -> Result<Arc<dyn ChangeFeed>> {
        match self {
            SourceConfig::Redis {
                url,
                stream_key,
                block_timeout,
                batch_size,
            } => {
                let connector = RedisConnector::new("source", url, retry.clone())
                    .map_err(|e| ReplicationError::Config(e.to_string()))?;
                Ok(Arc::new(RedisFeed::new(
                    Arc::new(connector),
                    stream_key.clone(),
                    parse_or(block_timeout, Duration::from_secs(5)),
                    *batch_size,
                )))
            }
            SourceConfig::Memory => Ok(Arc::new(MemoryFeed::new())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationConfig {
    /// SQLite file in WAL mode.
    Sqlite { path: String },
    /// Redis hashes, one pair per bucket.
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        prefix: String,
    },
    /// Process memory. Not durable.
    Memory,
}

fn default_key_prefix() -> String {
    "replicator".to_string()
}

impl DestinationConfig {
    fn validate(&self) -> Result<()> {
        match self {
            DestinationConfig::Sqlite { path } if path.is_empty() => {
                Err(ReplicationError::Config("destination path is required".into()))
            }
            DestinationConfig::Redis { url, .. } if url.is_empty() => {
                Err(ReplicationError::Config("destination url is required".into()))
            }
            _ => Ok(()),
        }
    }

    /// Open the store. SQLite opens (and creates) the file here.
    pub async fn open(&self, retry: &RetryConfig) -> Result<Arc<dyn KvStore>> {
        match self {
            DestinationConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path).await?)),
            DestinationConfig::Redis { url, prefix } => Ok(Arc::new(
                RedisStore::new(url, prefix.clone(), retry.clone())
                    .map_err(|e| ReplicationError::Config(e.to_string()))?,
            )),
            DestinationConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// One replication stream: identity, subscription and trigger chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Checkpoint identity. Must be unique and stable across restarts.
    pub consumer_id: String,
    pub source_query: SourceQuery,
    pub trigger_chain: Vec<TriggerSpec>,
}

impl StreamConfig {
    /// Structural checks; trigger kinds and options are checked when the
    /// chain is built.
    pub fn validate(&self, checkpoint_bucket: &str) -> Result<()> {
        if self.consumer_id.trim().is_empty() {
            return Err(ReplicationError::Config("stream consumer_id must not be empty".into()));
        }
        self.source_query.validate()?;

        if self.trigger_chain.is_empty() {
            return Err(ReplicationError::Config(format!(
                "stream '{}' has an empty trigger chain",
                self.consumer_id
            )));
        }
        if let Some(spec) = self.trigger_chain.iter().find(|s| s.bucket() == checkpoint_bucket) {
            return Err(ReplicationError::Config(format!(
                "stream '{}': trigger '{}' writes to the checkpoint bucket '{checkpoint_bucket}'",
                self.consumer_id, spec.kind
            )));
        }
        Ok(())
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn check_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{field}: invalid duration '{value}': {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SearchScope;

    const EXAMPLE: &str = r#"
settings:
  consumer:
    heartbeat_timeout: "10s"
    max_batch_events: 8
  backoff:
    initial_delay: "200ms"
    max_delay: "1m"

source:
  type: redis
  url: "redis://localhost:6379"

destination:
  type: sqlite
  path: "/tmp/replicator.db"

streams:
  - consumer_id: people
    source_query:
      base_dn: "ou=people,dc=example,dc=com"
      scope: one
    trigger_chain:
      - kind: mirror
        bucket: people
      - kind: changelog
"#;

    #[test]
    fn test_parse_example() {
        let config = ReplicatorConfig::from_yaml(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.settings.checkpoint_bucket, DEFAULT_CHECKPOINT_BUCKET);
        assert_eq!(config.streams.len(), 1);
        let stream = &config.streams[0];
        assert_eq!(stream.source_query.scope, SearchScope::One);
        assert_eq!(stream.source_query.filter, "(objectClass=*)");
        assert_eq!(stream.trigger_chain[1].bucket(), "changelog");

        match &config.source {
            SourceConfig::Redis { stream_key, block_timeout, batch_size, .. } => {
                assert_eq!(stream_key, "directory:changes");
                assert_eq!(block_timeout, "5s");
                assert_eq!(*batch_size, 100);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_supervisor_settings_conversion() {
        let config = ReplicatorConfig::from_yaml(EXAMPLE).unwrap();
        let s = config.settings.supervisor_settings();
        assert_eq!(s.consumer.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(s.consumer.batch.max_batch_events, 8);
        assert_eq!(s.consumer.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(s.consumer.retry.max_delay, Duration::from_secs(60));
        assert_eq!(s.consumer.retry.max_attempts, usize::MAX);
        assert!(s.consumer.rate_limit.is_none());
        assert_eq!(s.circuit.failure_threshold, 5);
        assert_eq!(s.drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::from_yaml("source: {type: memory}\ndestination: {type: memory}\n").unwrap();
        config.validate().unwrap();
        assert!(config.streams.is_empty());
        assert_eq!(config.settings.consumer.max_batch_events, 1);
        assert_eq!(config.settings.consumer.heartbeat_timeout_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let mut config = ReplicatorConfig::for_testing();
        config.settings.consumer.heartbeat_timeout = "soon".into();
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_rejects_block_timeout_outliving_heartbeat() {
        let mut config = ReplicatorConfig::from_yaml(EXAMPLE).unwrap();
        let set_block = |config: &mut ReplicatorConfig, value: &str| {
            if let SourceConfig::Redis { block_timeout, .. } = &mut config.source {
                *block_timeout = value.into();
            }
        };

        set_block(&mut config, "10s");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
        assert!(err.to_string().contains("block_timeout"));

        set_block(&mut config, "60s");
        assert!(config.validate().is_err());

        set_block(&mut config, "9s");
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_duplicate_streams() {
        let mut config = ReplicatorConfig::from_yaml(EXAMPLE).unwrap();
        config.streams.push(config.streams[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_trigger_writing_checkpoints() {
        let stream = StreamConfig {
            consumer_id: "people".into(),
            source_query: SourceQuery::subtree("dc=x"),
            trigger_chain: vec![TriggerSpec::new("mirror", DEFAULT_CHECKPOINT_BUCKET)],
        };
        assert!(stream.validate(DEFAULT_CHECKPOINT_BUCKET).is_err());
        assert!(stream.validate("elsewhere").is_ok());
    }

    #[test]
    fn test_rejects_bad_query_and_empty_chain() {
        let mut stream = StreamConfig {
            consumer_id: "people".into(),
            source_query: SourceQuery::subtree("people"),
            trigger_chain: vec![TriggerSpec::new("mirror", "m")],
        };
        assert!(stream.validate(DEFAULT_CHECKPOINT_BUCKET).is_err());

        stream.source_query = SourceQuery::subtree("dc=x");
        stream.trigger_chain.clear();
        assert!(stream.validate(DEFAULT_CHECKPOINT_BUCKET).is_err());
    }

    #[test]
    fn test_rate_limit_config() {
        let mut c = ConsumerConfig::default();
        assert!(c.rate_limit_config().is_none());
        c.rate_limit_enabled = true;
        let rl = c.rate_limit_config().unwrap();
        assert_eq!(rl.refill_rate, 1000);
        assert_eq!(rl.burst_size, 100);
    }

    #[test]
    fn test_unknown_source_type_fails_to_parse() {
        let err = ReplicatorConfig::from_yaml("source: {type: ldap}\ndestination: {type: memory}\n");
        assert!(matches!(err, Err(ReplicationError::Yaml(_))));
    }

    #[tokio::test]
    async fn test_build_memory_backends() {
        let config = ReplicatorConfig::for_testing();
        let retry = config.settings.backoff.retry_config();
        assert_eq!(config.source.build(&retry).unwrap().name(), "memory");
        assert_eq!(config.destination.open(&retry).await.unwrap().name(), "memory");
    }
}
