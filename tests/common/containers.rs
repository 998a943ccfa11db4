// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! One container serves as both the change feed (a stream) and the
//! destination store (hashes under a prefix).

use directory_replicator::connection::RedisConnector;
use directory_replicator::feed::RedisFeed;
use directory_replicator::resilience::RetryConfig;
use directory_replicator::store::RedisStore;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const CHANGE_STREAM: &str = "directory:changes";

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container plus feed and store handles pointing at it.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    pub fn feed(&self) -> RedisFeed {
        let connector = RedisConnector::new("test-source", &self.url, RetryConfig::testing())
            .expect("valid redis url");
        RedisFeed::new(Arc::new(connector), CHANGE_STREAM, Duration::from_millis(200), 100)
    }

    pub fn store(&self, prefix: &str) -> RedisStore {
        RedisStore::new(&self.url, prefix, RetryConfig::testing()).expect("valid redis url")
    }

    /// Raw connection for poking at the stream directly.
    pub async fn connection(&self) -> redis::aio::MultiplexedConnection {
        redis::Client::open(self.url.as_str())
            .expect("valid redis url")
            .get_multiplexed_async_connection()
            .await
            .expect("redis reachable")
    }
}
