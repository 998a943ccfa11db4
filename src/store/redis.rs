//! Redis-backed destination store.
//!
//! Each bucket is two hashes under a configurable prefix:
//!
//! ```text
//! {prefix}:{bucket}        field = key, value = JSON document
//! {prefix}:{bucket}:etag   field = key, value = etag
//! ```
//!
//! A batch runs as one Lua script: every precondition is checked first and
//! nothing is written unless all of them hold. Redis executes scripts
//! atomically, so readers see either the whole batch or none of it.

use super::{BatchAction, BatchOp, BoxFuture, KvStore, Precondition, Record};
use crate::connection::RedisConnector;
use crate::error::StoreError;
use crate::resilience::RetryConfig;
use redis::Script;

/// KEYS: (value hash, etag hash) per op.
/// ARGV: (field, action, precondition, expected etag, body, new etag) per op.
/// Returns {1, 0} on success, {0, i} when op i's precondition fails.
const BATCH_SCRIPT: &str = r#"
local n = #KEYS / 2
for i = 1, n do
  local base = (i - 1) * 6
  local cur = redis.call('HGET', KEYS[2 * i], ARGV[base + 1])
  local kind = ARGV[base + 3]
  if kind == 'absent' then
    if cur then return {0, i} end
  elseif kind == 'etag' then
    if cur ~= ARGV[base + 4] then return {0, i} end
  end
end
for i = 1, n do
  local base = (i - 1) * 6
  local field = ARGV[base + 1]
  if ARGV[base + 2] == 'put' then
    redis.call('HSET', KEYS[2 * i - 1], field, ARGV[base + 5])
    redis.call('HSET', KEYS[2 * i], field, ARGV[base + 6])
  else
    redis.call('HDEL', KEYS[2 * i - 1], field)
    redis.call('HDEL', KEYS[2 * i], field)
  end
end
return {1, 0}
"#;

pub struct RedisStore {
    connector: RedisConnector,
    prefix: String,
    script: Script,
}

impl RedisStore {
    /// Create the store. The connection is established on first use.
    pub fn new(url: &str, prefix: impl Into<String>, retry: RetryConfig) -> Result<Self, StoreError> {
        Ok(Self {
            connector: RedisConnector::new("destination", url, retry)?,
            prefix: prefix.into(),
            script: Script::new(BATCH_SCRIPT),
        })
    }

    fn value_key(&self, bucket: &str) -> String {
        format!("{}:{}", self.prefix, bucket)
    }

    fn etag_key(&self, bucket: &str) -> String {
        format!("{}:{}:etag", self.prefix, bucket)
    }

    async fn fetch(&self, bucket: String, key: String) -> Result<Option<Record>, StoreError> {
        let mut conn = self.connector.ensure_connected().await?;

        let result: redis::RedisResult<(Option<String>, Option<String>)> = redis::pipe()
            .atomic()
            .hget(self.value_key(&bucket), &key)
            .hget(self.etag_key(&bucket), &key)
            .query_async(&mut conn)
            .await;

        let (value, etag) = match result {
            Ok(pair) => pair,
            Err(e) => {
                self.connector.invalidate().await;
                return Err(StoreError::unavailable("get", e.to_string()));
            }
        };

        match (value, etag) {
            (Some(value), Some(etag)) => {
                let value = serde_json::from_str(&value).map_err(|e| StoreError::Corrupt {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    message: e.to_string(),
                })?;
                Ok(Some(Record { value, etag }))
            }
            (None, None) => Ok(None),
            _ => Err(StoreError::Corrupt {
                bucket,
                key,
                message: "value and etag hashes out of sync".to_string(),
            }),
        }
    }

    async fn apply(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.connector.ensure_connected().await?;

        let mut invocation = self.script.prepare_invoke();
        for op in &ops {
            invocation.key(self.value_key(&op.bucket));
            invocation.key(self.etag_key(&op.bucket));

            let (kind, expected) = match &op.precondition {
                Precondition::None => ("none", ""),
                Precondition::Absent => ("absent", ""),
                Precondition::Etag(etag) => ("etag", etag.as_str()),
            };
            let (action, body, etag) = match &op.action {
                BatchAction::Put(value) => {
                    let record = Record::new(value.clone());
                    ("put", record.value.to_string(), record.etag)
                }
                BatchAction::Delete => ("del", String::new(), String::new()),
            };
            invocation
                .arg(&op.key)
                .arg(action)
                .arg(kind)
                .arg(expected)
                .arg(body)
                .arg(etag);
        }

        let reply: Vec<i64> = match invocation.invoke_async(&mut conn).await {
            Ok(reply) => reply,
            Err(e) => {
                self.connector.invalidate().await;
                return Err(StoreError::unavailable("put_batch", e.to_string()));
            }
        };

        match reply.as_slice() {
            [1, _] => Ok(()),
            [0, idx] => {
                let op = usize::try_from(*idx)
                    .ok()
                    .and_then(|i| i.checked_sub(1))
                    .and_then(|i| ops.get(i))
                    .ok_or_else(|| StoreError::unavailable("put_batch", format!("bad script reply index {idx}")))?;
                Err(op.precondition_failed())
            }
            other => Err(StoreError::unavailable(
                "put_batch",
                format!("unexpected script reply {other:?}"),
            )),
        }
    }
}

impl KvStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    fn get(&self, bucket: &str, key: &str) -> BoxFuture<'_, Option<Record>> {
        Box::pin(self.fetch(bucket.to_string(), key.to_string()))
    }

    fn put_batch(&self, ops: Vec<BatchOp>) -> BoxFuture<'_, ()> {
        Box::pin(self.apply(ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let store = RedisStore::new("redis://127.0.0.1:6379", "repl", RetryConfig::testing()).unwrap();
        assert_eq!(store.value_key("mirror"), "repl:mirror");
        assert_eq!(store.etag_key("mirror"), "repl:mirror:etag");
    }

    #[test]
    fn test_bad_url_is_unavailable() {
        let err = RedisStore::new("nope://", "p", RetryConfig::testing()).err().unwrap();
        assert!(err.is_transient());
    }
}
