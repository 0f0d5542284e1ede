use std::collections::HashMap;

use async_trait::async_trait;

/// A list query as offered to plugins.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Route directory the query arrived on, e.g. `/list/`.
    pub dir: String,
    /// List key in the store.
    pub key: String,
    /// Query-string parameters. A repeated name keeps its first value.
    pub params: HashMap<String, String>,
}

impl ListRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Read-back access to the list a query is about.
#[async_trait]
pub trait ListLookup: Send + Sync {
    /// Raw entries `[start, end)`, newest first.
    async fn lookup(&self, start: i64, end: i64) -> anyhow::Result<Vec<String>>;
}

/// Interface every capability provider implements.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Provider version. An empty version fails the load-time probe.
    fn version(&self) -> &str;

    /// Transform an outgoing message. The default passes it through.
    fn transform(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        Ok(payload)
    }

    /// Answer a list query. `Ok(None)` (or an empty body) declines it.
    async fn serve_list(
        &self,
        _req: &ListRequest,
        _lookup: &dyn ListLookup,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
