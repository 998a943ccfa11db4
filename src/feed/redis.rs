// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed backed by a Redis Stream.
//!
//! The directory's change log is published into one stream, one entry per
//! change, with the change number as the entry ID (`<changenumber>-0`).
//! Resuming after change `S` is then a plain `XREAD ... STREAMS key S-0`.
//!
//! # Entry Format
//!
//! ```text
//! XADD directory:changes 42-0
//!     dn          "cn=alice,ou=people,dc=example,dc=com"
//!     changes     <JSON {attr: [values]}, zstd-compressed if large>
//!     hash        <hex sha256 of the uncompressed changes, optional>
//!     controls    <JSON array of {type, value} controls>
//!     changetime  "20260102030405Z"            (optional)
//! ```
//!
//! # Gap Detection
//!
//! On subscribe the stream's `max-deleted-entry-id` (Redis 7+) is compared
//! with the resume position. If entries after the checkpoint were trimmed
//! the subscription fails with [`SourceError::Gap`]. Older servers fall
//! back to comparing against the oldest retained entry.

use super::{BoxFuture, ChangeFeed, ChangeSubscription, FeedItem, ScopeMatcher, SourceQuery};
use crate::connection::RedisConnector;
use crate::error::SourceError;
use crate::event::{entry_change_metadata, Attributes, ChangeEvent, OperationKind};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Zstd magic bytes: 0x28 0xB5 0x2F 0xFD
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Payloads at least this large are compressed on publish.
const COMPRESS_THRESHOLD_BYTES: usize = 4096;

pub struct RedisFeed {
    connector: Arc<RedisConnector>,
    stream_key: String,
    block_timeout: Duration,
    batch_size: usize,
}

impl RedisFeed {
    pub fn new(connector: Arc<RedisConnector>, stream_key: impl Into<String>, block_timeout: Duration, batch_size: usize) -> Self {
        Self {
            connector,
            stream_key: stream_key.into(),
            block_timeout,
            batch_size: batch_size.max(1),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Append one change to the stream.
    pub async fn publish(
        &self,
        sequence_number: u64,
        operation: OperationKind,
        dn: &str,
        attributes: &Attributes,
        change_time: Option<&str>,
    ) -> Result<(), SourceError> {
        let mut conn = self.connector.ensure_connected().await?;

        let changes = serde_json::to_vec(attributes)
            .map_err(|e| SourceError::malformed(Some(sequence_number), e.to_string()))?;
        let hash = compute_content_hash(&changes);
        let payload = if changes.len() >= COMPRESS_THRESHOLD_BYTES {
            zstd::encode_all(changes.as_slice(), 3)
                .map_err(|e| SourceError::malformed(Some(sequence_number), format!("zstd encode: {e}")))?
        } else {
            changes
        };

        let metadata = entry_change_metadata(dn, sequence_number, operation);
        let controls = metadata.get("controls").cloned().unwrap_or(Value::Null).to_string();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key)
            .arg(format!("{sequence_number}-0"))
            .arg("dn")
            .arg(dn)
            .arg("changes")
            .arg(payload)
            .arg("hash")
            .arg(hash)
            .arg("controls")
            .arg(controls);
        if let Some(t) = change_time {
            cmd.arg("changetime").arg(t);
        }

        let result: redis::RedisResult<String> = cmd.query_async(&mut conn).await;
        if let Err(e) = result {
            self.connector.invalidate().await;
            return Err(SourceError::unavailable("XADD", e.to_string()));
        }
        Ok(())
    }

    /// Highest sequence number the stream has discarded (0 if none).
    async fn trimmed_through(&self, conn: &mut ConnectionManager, after: u64) -> Result<u64, SourceError> {
        let exists: bool = conn.exists(&self.stream_key).await?;
        if !exists {
            return Ok(0);
        }

        let info: redis::Value = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(&self.stream_key)
            .query_async(conn)
            .await?;

        if let Some(id) = info_field(&info, "max-deleted-entry-id") {
            return Ok(parse_change_id(&id).unwrap_or(0));
        }

        // Pre-7.0 server: the best we can do is the oldest retained entry.
        let oldest: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await?;
        match oldest.first().and_then(|(id, _)| parse_change_id(id)) {
            Some(first) if first > after + 1 => Ok(first - 1),
            _ => Ok(0),
        }
    }

    async fn open(&self, matcher: ScopeMatcher, after: u64) -> Result<Box<dyn ChangeSubscription>, SourceError> {
        let mut conn = self.connector.ensure_connected().await?;

        let trimmed = match self.trimmed_through(&mut conn, after).await {
            Ok(t) => t,
            Err(e) => {
                self.connector.invalidate().await;
                return Err(e);
            }
        };
        if trimmed > after {
            warn!(stream = %self.stream_key, after, trimmed, "Change log trimmed past checkpoint");
            return Err(SourceError::Gap {
                requested: after + 1,
                oldest: trimmed + 1,
            });
        }

        debug!(stream = %self.stream_key, after, "Subscribed to change stream");
        Ok(Box::new(RedisSubscription {
            connector: self.connector.clone(),
            conn,
            stream_key: self.stream_key.clone(),
            matcher,
            cursor: after,
            buffer: VecDeque::new(),
            block_timeout: self.block_timeout,
            batch_size: self.batch_size,
        }))
    }
}

impl ChangeFeed for RedisFeed {
    fn name(&self) -> &str {
        "redis"
    }

    fn subscribe(&self, query: &SourceQuery, after: u64) -> BoxFuture<'_, Box<dyn ChangeSubscription>> {
        let matcher = query.matcher();
        Box::pin(async move { self.open(matcher?, after).await })
    }
}

struct RedisSubscription {
    connector: Arc<RedisConnector>,
    conn: ConnectionManager,
    stream_key: String,
    matcher: ScopeMatcher,
    /// Last sequence number handed out (or skipped by scope).
    cursor: u64,
    /// Entries read but not yet handed out.
    buffer: VecDeque<(String, HashMap<String, redis::Value>)>,
    block_timeout: Duration,
    batch_size: usize,
}

impl RedisSubscription {
    async fn next(&mut self) -> Result<Option<FeedItem>, SourceError> {
        loop {
            if let Some((id, fields)) = self.buffer.front() {
                // Malformed entries stay at the head: the stream is stuck on
                // them until an operator steps in.
                let event = parse_entry(id, fields)?;
                self.buffer.pop_front();
                self.cursor = event.sequence_number;

                if !self.matcher.matches(&event.target_id) {
                    trace!(seq = event.sequence_number, dn = %event.target_id, "Out of scope, skipping");
                    continue;
                }
                return Ok(Some(FeedItem::Event(event)));
            }

            let opts = StreamReadOptions::default()
                .block(self.block_timeout.as_millis().max(1) as usize)
                .count(self.batch_size);
            let cursor = format!("{}-0", self.cursor);

            // XREAD BLOCK timeout COUNT batch STREAMS key cursor
            let reply: redis::RedisResult<StreamReadReply> =
                self.conn.xread_options(&[&self.stream_key], &[&cursor], &opts).await;
            let reply = match reply {
                Ok(r) => r,
                Err(e) => {
                    self.connector.invalidate().await;
                    return Err(SourceError::unavailable("XREAD", e.to_string()));
                }
            };

            let before = self.buffer.len();
            for key in reply.keys {
                for entry in key.ids {
                    self.buffer.push_back((entry.id, entry.map));
                }
            }
            if self.buffer.len() == before {
                return Ok(Some(FeedItem::Heartbeat));
            }
        }
    }
}

impl ChangeSubscription for RedisSubscription {
    fn next_item(&mut self) -> BoxFuture<'_, Option<FeedItem>> {
        Box::pin(self.next())
    }
}

/// Change number encoded in an entry ID (`<changenumber>-<n>`).
pub fn parse_change_id(id: &str) -> Option<u64> {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    seq.parse::<u64>().ok()?;
    ms.parse().ok()
}

/// Look up a field in an `XINFO STREAM` reply (RESP2 flat array or RESP3 map).
fn info_field(info: &redis::Value, name: &str) -> Option<String> {
    let as_string = |v: &redis::Value| match v {
        redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    };

    match info {
        redis::Value::Array(items) => items
            .chunks(2)
            .find(|pair| pair.first().and_then(as_string).as_deref() == Some(name))
            .and_then(|pair| pair.get(1))
            .and_then(as_string),
        redis::Value::Map(pairs) => pairs
            .iter()
            .find(|(k, _)| as_string(k).as_deref() == Some(name))
            .and_then(|(_, v)| as_string(v)),
        _ => None,
    }
}

/// Parse a stream entry into a change event.
fn parse_entry(id: &str, fields: &HashMap<String, redis::Value>) -> Result<ChangeEvent, SourceError> {
    let seq = parse_change_id(id).ok_or_else(|| SourceError::malformed(None, format!("bad entry id {id}")))?;
    let malformed = |reason: String| SourceError::malformed(Some(seq), reason);

    let dn = get_string_field(fields, "dn").map_err(malformed)?;
    let raw = get_bytes_field(fields, "changes").map_err(malformed)?;
    let changes = maybe_decompress(&raw).map_err(malformed)?;

    if fields.contains_key("hash") {
        let expected = get_string_field(fields, "hash").map_err(malformed)?;
        let actual = compute_content_hash(&changes);
        if expected != actual {
            return Err(malformed(format!("content hash mismatch (expected {expected}, got {actual})")));
        }
    }

    let attributes: Attributes =
        serde_json::from_slice(&changes).map_err(|e| malformed(format!("changes: {e}")))?;
    let controls: Value = serde_json::from_str(&get_string_field(fields, "controls").map_err(malformed)?)
        .map_err(|e| malformed(format!("controls: {e}")))?;

    let mut metadata = Map::new();
    metadata.insert("dn".into(), Value::String(dn));
    metadata.insert("controls".into(), controls);
    metadata.insert("stream_id".into(), Value::String(id.to_string()));
    if fields.contains_key("changetime") {
        let t = get_string_field(fields, "changetime").map_err(malformed)?;
        metadata.insert("changetime".into(), Value::String(t));
    }

    let event = ChangeEvent::from_metadata(attributes, metadata).map_err(|e| match e {
        SourceError::Malformed { reason, .. } => malformed(reason),
        other => other,
    })?;
    if event.sequence_number != seq {
        return Err(malformed(format!("entry {id} carries changeNumber {}", event.sequence_number)));
    }
    Ok(event)
}

fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String, String> {
    let value = fields.get(name).ok_or_else(|| format!("Missing field: {name}"))?;

    match value {
        redis::Value::BulkString(bytes) => {
            String::from_utf8(bytes.clone()).map_err(|e| format!("Invalid UTF-8 in {name}: {e}"))
        }
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(format!("Unexpected type for field {name}: {value:?}")),
    }
}

fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>, String> {
    let value = fields.get(name).ok_or_else(|| format!("Missing field: {name}"))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(format!("Unexpected type for field {name}: {value:?}")),
    }
}

/// Decompress zstd payloads, pass everything else through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>, String> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data).map_err(|e| format!("zstd init: {e}"))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| format!("zstd decode: {e}"))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Hex SHA-256 of a payload.
pub fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
