use {
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::api::{Capability, ListLookup, ListRequest};

/// A transform failure, tagged with the plugin that raised it.
#[derive(Debug, thiserror::Error)]
#[error("plugin '{plugin}' failed: {source}")]
pub struct PluginError {
    pub plugin: String,
    #[source]
    pub source: anyhow::Error,
}

struct LoadedPlugin {
    name: String,
    provider: Box<dyn Capability>,
}

/// Capability providers in load order. Immutable once built.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<LoadedPlugin>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider. Order of calls is the dispatch order.
    pub fn push(&mut self, name: impl Into<String>, provider: Box<dyn Capability>) {
        self.plugins.push(LoadedPlugin {
            name: name.into(),
            provider,
        });
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name == name)
    }

    /// `(name, version)` of every loaded plugin, in order.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.plugins
            .iter()
            .map(|p| (p.name.clone(), p.provider.version().to_string()))
            .collect()
    }

    /// Run `payload` through every plugin in order. The first failure
    /// stops the chain.
    pub fn transform(&self, payload: Value) -> Result<Value, PluginError> {
        self.plugins.iter().try_fold(payload, |acc, p| {
            p.provider.transform(acc).map_err(|source| PluginError {
                plugin: p.name.clone(),
                source,
            })
        })
    }

    /// Offer a list query to each plugin in order. The first non-empty
    /// response wins; failing plugins are logged and skipped.
    pub async fn serve_list(&self, req: &ListRequest, lookup: &dyn ListLookup) -> Option<String> {
        for p in &self.plugins {
            match p.provider.serve_list(req, lookup).await {
                Ok(Some(body)) if !body.is_empty() => {
                    debug!(plugin = %p.name, dir = %req.dir, key = %req.key, "list query served by plugin");
                    return Some(body);
                },
                Ok(_) => {},
                Err(e) => {
                    warn!(plugin = %p.name, key = %req.key, error = %e, "plugin list handler failed");
                },
            }
        }
        None
    }
}
