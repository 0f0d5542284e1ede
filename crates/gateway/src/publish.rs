//! Publish side: authenticated HTTP posts forwarded to internal topics.
//!
//! Channels are published under public ids so the internal topic naming
//! (`prefix:hostname::name`) never leaves the relay.

use std::{collections::HashMap, path::Path, sync::Arc};

use {
    anyhow::Context,
    pubrelay_broker::Broker,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{info, warn},
    uuid::Uuid,
};

use crate::{auth::Principal, error::GatewayError};

/// Public channel id → internal topic.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    topics: HashMap<String, String>,
}

impl ChannelMap {
    /// Build from a `{channel name: public id}` table. Empty ids are
    /// replaced with a fresh UUID.
    pub fn build(names: HashMap<String, String>, prefix: &str, hostname: &str) -> Self {
        let mut topics = HashMap::with_capacity(names.len());
        for (name, id) in names {
            let id = if id.is_empty() {
                let generated = Uuid::new_v4().to_string();
                info!(channel = %name, id = %generated, "generated public channel id");
                generated
            } else {
                id
            };
            let topic = format!("{prefix}:{hostname}::{name}");
            info!(channel = %name, id = %id, topic = %topic, "publish channel mapped");
            topics.insert(id, topic);
        }
        Self { topics }
    }

    /// Read the channels file and map it under this host's name.
    pub fn load(path: &Path, prefix: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read channels file {}", path.display()))?;
        let names: HashMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid channels file {}", path.display()))?;
        let hostname = hostname::get()
            .context("cannot resolve hostname")?
            .to_string_lossy()
            .into_owned();
        Ok(Self::build(names, prefix, &hostname))
    }

    pub fn topic_for(&self, id: &str) -> Option<&str> {
        self.topics.get(id).map(String::as_str)
    }

    /// `(public id, topic)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.topics.iter().map(|(id, t)| (id.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[derive(Debug)]
struct PublishRequest {
    channel_id: String,
    body: String,
    principal: Principal,
}

/// Front of the forwarding queue. Cheap to clone.
#[derive(Clone)]
pub struct PublishGateway {
    queue: mpsc::Sender<PublishRequest>,
    channels: Arc<ChannelMap>,
}

impl PublishGateway {
    /// Spawn the forwarding task and return the gateway feeding it.
    pub fn start(
        channels: ChannelMap,
        broker: Arc<dyn Broker>,
        queue: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let channels = Arc::new(channels);
        let task = tokio::spawn(forward(rx, Arc::clone(&channels), broker));
        (
            Self {
                queue: tx,
                channels,
            },
            task,
        )
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Enqueue `body` for `channel_id`. Waits for queue space; fails only
    /// once the forwarding task has gone.
    pub async fn publish(
        &self,
        channel_id: impl Into<String>,
        body: impl Into<String>,
        principal: Principal,
    ) -> Result<(), GatewayError> {
        self.queue
            .send(PublishRequest {
                channel_id: channel_id.into(),
                body: body.into(),
                principal,
            })
            .await
            .map_err(|_| GatewayError::QueueClosed)
    }
}

async fn forward(
    mut queue: mpsc::Receiver<PublishRequest>,
    channels: Arc<ChannelMap>,
    broker: Arc<dyn Broker>,
) {
    while let Some(req) = queue.recv().await {
        let Some(topic) = channels.topic_for(&req.channel_id) else {
            warn!(channel = %req.channel_id, principal = %req.principal, "publish to unknown channel id");
            continue;
        };
        match broker.publish(topic, &req.body).await {
            Ok(receivers) => {
                info!(topic = %topic, principal = %req.principal, receivers, "published");
            },
            Err(e) => {
                warn!(topic = %topic, principal = %req.principal, error = %e, "publish failed");
            },
        }
    }
    info!("publish queue closed, forwarder exiting");
}
