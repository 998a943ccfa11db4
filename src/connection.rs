//! Redis connection management shared by the Redis feed and store.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑             ↓             ↓
//!      └─── Backoff ←┴─────────────┘
//! ```
//!
//! Connections are **lazy**: they're only established when first needed
//! (via [`RedisConnector::ensure_connected()`]). A command error should be
//! reported with [`RedisConnector::invalidate()`] so the next call
//! reconnects instead of reusing a dead multiplexed socket.

use crate::error::{SourceError, StoreError};
use crate::metrics;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Last connect attempt ran out of retries.
    Backoff,
}

impl ConnectionState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        }
    }
}

/// Connection setup failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection to {name} failed: {message}")]
pub struct ConnectError {
    pub name: String,
    pub message: String,
}

impl From<ConnectError> for SourceError {
    fn from(e: ConnectError) -> Self {
        SourceError::unavailable("connect", e.to_string())
    }
}

impl From<ConnectError> for StoreError {
    fn from(e: ConnectError) -> Self {
        StoreError::unavailable("connect", e.to_string())
    }
}

/// A lazily established, shareable Redis connection.
///
/// `ConnectionManager` is Clone and multiplexed, so handing out clones is
/// cheap and every clone shares the same socket.
pub struct RedisConnector {
    name: String,
    url: String,
    client: Client,
    retry: RetryConfig,
    conn: RwLock<Option<ConnectionManager>>,
    state: RwLock<ConnectionState>,
    failure_count: AtomicU64,
}

impl RedisConnector {
    /// Validate the URL. Does not connect.
    pub fn new(name: impl Into<String>, url: &str, retry: RetryConfig) -> Result<Self, ConnectError> {
        let name = name.into();
        let client = Client::open(url).map_err(|e| ConnectError {
            name: name.clone(),
            message: format!("Invalid Redis URL: {e}"),
        })?;

        Ok(Self {
            name,
            url: url.to_string(),
            client,
            retry,
            conn: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            failure_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        metrics::record_connection_state(&self.name, state.as_str());
    }

    /// Return the live connection, connecting (with retry) if needed.
    pub async fn ensure_connected(&self) -> Result<ConnectionManager, ConnectError> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        self.connect().await
    }

    /// Drop the current connection after a command failure.
    pub async fn invalidate(&self) {
        if self.conn.write().await.take().is_some() {
            self.failure_count.fetch_add(1, Ordering::AcqRel);
            self.set_state(ConnectionState::Disconnected).await;
            warn!(connection = %self.name, "Connection invalidated after error");
        }
    }

    async fn connect(&self) -> Result<ConnectionManager, ConnectError> {
        self.set_state(ConnectionState::Connecting).await;
        info!(connection = %self.name, url = %self.url, "Connecting to Redis");

        let mut attempt = 0;
        loop {
            attempt += 1;

            // Bound each attempt so unreachable hosts don't hang the caller
            let message = match timeout(self.retry.connection_timeout, self.client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn.clone());
                    self.failure_count.store(0, Ordering::Release);
                    self.set_state(ConnectionState::Connected).await;
                    metrics::record_connection(&self.name, true);
                    if attempt > 1 {
                        info!(connection = %self.name, attempt, "Connected to Redis after retry");
                    } else {
                        info!(connection = %self.name, "Connected to Redis");
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.retry.connection_timeout),
            };

            self.failure_count.fetch_add(1, Ordering::AcqRel);
            metrics::record_connection(&self.name, false);

            if attempt >= self.retry.max_attempts {
                self.set_state(ConnectionState::Backoff).await;
                error!(connection = %self.name, attempt, error = %message, "Failed to connect after max retries");
                return Err(ConnectError {
                    name: self.name.clone(),
                    message: format!("Connection failed after {attempt} attempts: {message}"),
                });
            }

            let delay = self.retry.delay_with_jitter(attempt);
            warn!(
                connection = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
