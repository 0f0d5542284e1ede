use std::sync::Arc;

use {
    pubrelay_broker::Broker,
    pubrelay_plugins::PluginChain,
    pubrelay_protocol::RelayMode,
};

use crate::{
    auth::IdentityGate, connections::ConnectionRegistry, publish::PublishGateway,
    tickets::TicketBroker,
};

/// Shared gateway runtime state. Each table carries its own lock.
pub struct GatewayState {
    pub mode: RelayMode,
    pub version: String,
    pub identities: IdentityGate,
    pub tickets: TicketBroker,
    pub connections: Arc<ConnectionRegistry>,
    pub plugins: Arc<PluginChain>,
    pub broker: Arc<dyn Broker>,
    /// Set in publish mode only.
    pub publisher: Option<PublishGateway>,
}

/// Tunables that are not services themselves.
#[derive(Debug, Clone, Copy)]
pub struct StateOptions {
    pub ticket_ttl_secs: u64,
    pub write_queue: usize,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: 60,
            write_queue: 256,
        }
    }
}

impl GatewayState {
    pub fn new(
        identities: IdentityGate,
        broker: Arc<dyn Broker>,
        plugins: PluginChain,
        publisher: Option<PublishGateway>,
        options: StateOptions,
    ) -> Arc<Self> {
        let plugins = Arc::new(plugins);
        let mode = if publisher.is_some() {
            RelayMode::Publish
        } else {
            RelayMode::Subscribe
        };
        Arc::new(Self {
            mode,
            version: env!("CARGO_PKG_VERSION").to_string(),
            identities,
            tickets: TicketBroker::new(options.ticket_ttl_secs),
            connections: Arc::new(ConnectionRegistry::new(
                Arc::clone(&plugins),
                options.write_queue,
            )),
            plugins,
            broker,
            publisher,
        })
    }
}
