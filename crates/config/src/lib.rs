//! Relay configuration: schema, discovery and `${ENV}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::{
        BrokerBackend, BrokerConfig, ConnectionsConfig, IdentityConfig, PluginEntry,
        PublishConfig, RelayConfig, ServerConfig, TicketsConfig,
    },
};
