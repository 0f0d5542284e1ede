//! Redis-backed broker: `PUBLISH`/`SUBSCRIBE` for topics, `LRANGE` for lists.

use {
    async_trait::async_trait,
    futures::{StreamExt, future},
    redis::{AsyncCommands, aio::MultiplexedConnection},
    secrecy::{ExposeSecret, Secret},
    tracing::{info, warn},
};

use crate::{Broker, BrokerError, Result, Subscription, check_range};

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

/// Connection settings for [`RedisBroker`].
#[derive(Debug)]
pub struct RedisOptions {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<Secret<String>>,
}

impl RedisOptions {
    fn url(&self) -> String {
        let Self { host, port, db, .. } = self;
        match &self.password {
            Some(pw) => format!(
                "redis://:{}@{host}:{port}/{db}",
                urlencoding::encode(pw.expose_secret())
            ),
            None => format!("redis://{host}:{port}/{db}"),
        }
    }

    /// `host:port/db`, safe to log.
    pub fn display_addr(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }
}

pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// Open a multiplexed connection and verify it with `PING`.
    pub async fn connect(opts: &RedisOptions) -> Result<Self> {
        let client = redis::Client::open(opts.url())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let broker = Self { client, conn };
        broker.ping().await?;
        info!(addr = %opts.display_addr(), "connected to redis");
        Ok(broker)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        Ok(receivers.max(0) as u64)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        // Each subscription owns its own connection so that dropping it
        // unsubscribes without touching other streams.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let name = topic.to_string();
        let feed = pubsub.into_on_message().filter_map(move |msg| {
            future::ready(match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(topic = %name, error = %e, "dropping undecodable message");
                    None
                },
            })
        });
        Ok(Subscription::new(topic, feed))
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        check_range(start, end)?;
        let mut conn = self.conn.clone();
        // LRANGE bounds are inclusive.
        let entries: Vec<String> = conn.lrange(key, start as isize, (end - 1) as isize).await?;
        Ok(entries)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BrokerError::Protocol(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_password() {
        let opts = RedisOptions {
            host: "cache".into(),
            port: 6380,
            db: 2,
            password: Some(Secret::new("p@ss:word".to_string())),
        };
        assert_eq!(opts.url(), "redis://:p%40ss%3Aword@cache:6380/2");
        assert_eq!(opts.display_addr(), "cache:6380/2");
    }

    #[test]
    fn url_without_password() {
        let opts = RedisOptions {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        };
        assert_eq!(opts.url(), "redis://localhost:6379/0");
    }
}
