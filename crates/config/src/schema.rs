/// Config schema types (server, broker, identity, publish, tickets,
/// connections, plugins).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub identity: IdentityConfig,
    pub publish: PublishConfig,
    pub tickets: TicketsConfig,
    pub connections: ConnectionsConfig,
    /// Capability providers, applied in this order.
    pub plugins: Vec<PluginEntry>,
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 56545,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Redis,
    Memory,
}

/// Backend pub/sub + list store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub host: String,
    pub port: u16,
    pub db: i64,
    /// Falls back to `PUBRELAY_BROKER_PASSWORD` when unset.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Redis,
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl BrokerConfig {
    pub const PASSWORD_ENV: &'static str = "PUBRELAY_BROKER_PASSWORD";

    /// Configured password, or the environment fallback. Empty counts as unset.
    pub fn resolve_password(&self) -> Option<String> {
        self.password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(Self::PASSWORD_ENV).ok())
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// JSON object mapping user name to password.
    pub users_file: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            users_file: PathBuf::from("./users.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// JSON object mapping channel name to public id. Its presence
    /// switches the process into publish mode.
    pub channels_file: PathBuf,
    pub prefix: String,
    /// Capacity of the forwarding queue.
    pub queue: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            channels_file: PathBuf::from("./publish.json"),
            prefix: "rhp".into(),
            queue: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketsConfig {
    /// Seconds a subscribe ticket stays redeemable. `0` disables expiry.
    pub ttl_secs: u64,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Per-connection outbound queue; messages beyond it are dropped.
    pub write_queue: usize,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self { write_queue: 256 }
    }
}

/// One configured capability provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Provider-specific settings, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 56545);
        assert_eq!(cfg.broker.backend, BrokerBackend::Redis);
        assert_eq!(cfg.tickets.ttl_secs, 60);
        assert_eq!(cfg.connections.write_queue, 256);
        assert_eq!(cfg.publish.prefix, "rhp");
        assert!(cfg.plugins.is_empty());
    }

    #[test]
    fn plugins_keep_declared_order() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            [[plugins]]
            name = "timeseries"

            [[plugins]]
            name = "audit"
            enabled = false
            settings = { level = "debug" }
            "#,
        )
        .unwrap();
        let names: Vec<&str> = cfg.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["timeseries", "audit"]);
        assert!(cfg.plugins[0].enabled);
        assert!(!cfg.plugins[1].enabled);
        assert_eq!(cfg.plugins[1].settings["level"], "debug");
    }

    #[test]
    fn password_is_never_serialized() {
        let mut cfg = RelayConfig::default();
        cfg.broker.password = Some("hunter2".into());
        let out = toml::to_string(&cfg).unwrap();
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn empty_password_counts_as_unset() {
        let cfg = BrokerConfig {
            password: Some(String::new()),
            ..BrokerConfig::default()
        };
        // Only the env fallback can satisfy it now.
        if std::env::var(BrokerConfig::PASSWORD_ENV).is_err() {
            assert!(cfg.resolve_password().is_none());
        }
    }
}
