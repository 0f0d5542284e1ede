//! Backend broker: topic pub/sub plus an append-list history store.
//!
//! The gateway only ever talks to a [`Broker`]. Production runs use the
//! Redis implementation; tests and local runs use [`MemoryBroker`].
//!
//! List ranges are half-open everywhere in this crate: `range(key, 0, 10)`
//! returns at most ten entries, indices `0..10`, newest first.

use {
    async_trait::async_trait,
    futures::{Stream, StreamExt, stream::BoxStream},
};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use redis_store::{RedisBroker, RedisOptions};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("invalid range [{start}, {end})")]
    InvalidRange { start: i64, end: i64 },

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

// ── Subscription ─────────────────────────────────────────────────────────────

/// A live subscription to one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    feed: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, feed: impl Stream<Item = String> + Send + 'static) -> Self {
        Self {
            topic: topic.into(),
            feed: feed.boxed(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message payload, or `None` once the broker side has gone away.
    pub async fn next_message(&mut self) -> Option<String> {
        self.feed.next().await
    }

    /// Release the subscription.
    pub fn close(self) {
        tracing::debug!(topic = %self.topic, "subscription closed");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `topic`. Returns the number of receivers.
    async fn publish(&self, topic: &str, payload: &str) -> Result<u64>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Entries `[start, end)` of the list stored at `key`, newest first.
    /// A missing key is an empty list.
    async fn range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>>;

    /// Round-trip check used at startup.
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn check_range(start: i64, end: i64) -> Result<()> {
    if start < 0 || end <= start {
        return Err(BrokerError::InvalidRange { start, end });
    }
    Ok(())
}
