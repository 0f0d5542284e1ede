//! In-process broker: `tokio::sync::broadcast` topics and `VecDeque` lists.

use std::collections::{HashMap, VecDeque};

use {
    async_trait::async_trait,
    futures::{StreamExt, future},
    tokio::sync::{Mutex, broadcast},
    tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
    tracing::warn,
};

use crate::{Broker, Result, Subscription, check_range};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    topic_capacity: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_topic_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// `capacity` bounds how far a slow subscriber may lag before it
    /// starts missing messages.
    pub fn with_topic_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            topic_capacity: capacity.max(1),
        }
    }

    /// Push `value` onto the front of the list at `key` (newest first).
    pub async fn push_front(&self, key: &str, value: impl Into<String>) {
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_front(value.into());
    }

    /// Number of live subscribers on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<u64> {
        let mut topics = self.topics.lock().await;
        let Some(tx) = topics.get(topic) else {
            return Ok(0);
        };
        match tx.send(payload.to_string()) {
            Ok(n) => Ok(n as u64),
            Err(_) => {
                // Every subscriber has gone; forget the topic.
                topics.remove(topic);
                Ok(0)
            },
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let rx = self
            .topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .subscribe();

        let name = topic.to_string();
        let feed = BroadcastStream::new(rx).filter_map(move |item| {
            future::ready(match item {
                Ok(msg) => Some(msg),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(topic = %name, skipped, "subscriber lagged, messages skipped");
                    None
                },
            })
        });
        Ok(Subscription::new(topic, feed))
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        check_range(start, end)?;
        let lists = self.lists.lock().await;
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .skip(start as usize)
            .take((end - start) as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
