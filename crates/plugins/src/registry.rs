use std::collections::BTreeMap;

use {
    pubrelay_config::PluginEntry,
    tracing::{info, warn},
};

use crate::{api::Capability, chain::PluginChain, timeseries};

/// Builds a provider from its `settings` table.
pub type ProviderFactory = fn(&serde_json::Value) -> anyhow::Result<Box<dyn Capability>>;

/// Compiled-in providers, addressable by name from config.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding every provider shipped with the relay.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(timeseries::NAME, timeseries::TimeseriesPlugin::factory);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the plugin chain from config entries, in declaration order.
    ///
    /// Disabled, unknown, duplicate, failing or unprobeable entries are
    /// skipped with a warning. Loading never fails as a whole.
    pub fn load(&self, entries: &[PluginEntry]) -> PluginChain {
        let mut chain = PluginChain::new();
        for entry in entries {
            if !entry.enabled {
                info!(plugin = %entry.name, "plugin disabled, skipping");
                continue;
            }
            if chain.contains(&entry.name) {
                warn!(plugin = %entry.name, "plugin listed twice, keeping first");
                continue;
            }
            let Some(factory) = self.factories.get(&entry.name) else {
                warn!(plugin = %entry.name, known = ?self.names(), "unknown plugin, skipping");
                continue;
            };
            let provider = match factory(&entry.settings) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(plugin = %entry.name, error = %e, "failed to load plugin, skipping");
                    continue;
                },
            };
            if provider.version().is_empty() {
                warn!(plugin = %entry.name, "plugin reports no version, skipping");
                continue;
            }
            info!(plugin = %entry.name, version = %provider.version(), "loaded plugin");
            chain.push(entry.name.clone(), provider);
        }
        chain
    }
}
