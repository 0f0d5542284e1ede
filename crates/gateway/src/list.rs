use std::collections::HashMap;

use {
    async_trait::async_trait,
    pubrelay_broker::Broker,
    pubrelay_plugins::{ListLookup, ListRequest, PluginChain},
    pubrelay_protocol::{DEFAULT_LIST_END, DEFAULT_LIST_START, routes::LIST_DIR},
};

use crate::error::GatewayError;

/// Read-back access to one list key, handed to plugins.
pub struct BrokerLookup<'a> {
    broker: &'a dyn Broker,
    key: &'a str,
}

impl<'a> BrokerLookup<'a> {
    pub fn new(broker: &'a dyn Broker, key: &'a str) -> Self {
        Self { broker, key }
    }
}

#[async_trait]
impl ListLookup for BrokerLookup<'_> {
    async fn lookup(&self, start: i64, end: i64) -> anyhow::Result<Vec<String>> {
        Ok(self.broker.range(self.key, start, end).await?)
    }
}

fn bound(params: &HashMap<String, String>, name: &str, default: i64) -> Result<i64, GatewayError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| GatewayError::BadRequest(format!("{name}={raw:?} is not an integer"))),
    }
}

/// `start`/`end` query bounds, defaulting to `[0, 10)`.
pub fn parse_bounds(params: &HashMap<String, String>) -> Result<(i64, i64), GatewayError> {
    let start = bound(params, "start", DEFAULT_LIST_START)?;
    let end = bound(params, "end", DEFAULT_LIST_END)?;
    if start < 0 || end <= start {
        return Err(GatewayError::BadRequest(format!(
            "invalid range [{start}, {end})"
        )));
    }
    Ok((start, end))
}

/// Entries `[start, end)` of `key` as a JSON array of strings.
pub async fn default_list(
    broker: &dyn Broker,
    key: &str,
    params: &HashMap<String, String>,
) -> Result<String, GatewayError> {
    let (start, end) = parse_bounds(params)?;
    let entries = broker.range(key, start, end).await?;
    serde_json::to_string(&entries).map_err(|e| GatewayError::BadRequest(e.to_string()))
}

/// Answer a `/list/{key}` query: plugins first, then the default slice.
pub async fn serve_list(
    broker: &dyn Broker,
    plugins: &PluginChain,
    key: &str,
    params: HashMap<String, String>,
) -> Result<String, GatewayError> {
    if key.is_empty() {
        return Err(GatewayError::BadRequest("empty list key".into()));
    }
    let request = ListRequest {
        dir: LIST_DIR.to_string(),
        key: key.to_string(),
        params,
    };
    let lookup = BrokerLookup::new(broker, key);
    if let Some(body) = plugins.serve_list(&request, &lookup).await {
        return Ok(body);
    }
    default_list(broker, key, &request.params).await
}

#[cfg(test)]
mod tests {
    use {super::*, pubrelay_broker::MemoryBroker, pubrelay_plugins::ProviderRegistry};

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// `count` entries, newest (`e{count-1}`) first.
    async fn store(count: usize) -> MemoryBroker {
        let broker = MemoryBroker::new();
        for i in 0..count {
            broker.push_front("k", format!("e{i}")).await;
        }
        broker
    }

    async fn list(broker: &MemoryBroker, pairs: &[(&str, &str)]) -> Result<Vec<String>, GatewayError> {
        let body = default_list(broker, "k", &params(pairs)).await?;
        Ok(serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn defaults_to_first_ten() {
        let broker = store(25).await;
        let entries = list(&broker, &[]).await.unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0], "e24");
        assert_eq!(entries[9], "e15");
    }

    #[tokio::test]
    async fn range_is_half_open_at_both_edges() {
        let broker = store(25).await;
        assert_eq!(list(&broker, &[("start", "3"), ("end", "4")]).await.unwrap(), ["e21"]);
        let tail = list(&broker, &[("start", "20"), ("end", "30")]).await.unwrap();
        assert_eq!(tail, ["e4", "e3", "e2", "e1", "e0"]);
    }

    #[tokio::test]
    async fn missing_key_is_empty_array() {
        let broker = MemoryBroker::new();
        let body = default_list(&broker, "absent", &params(&[])).await.unwrap();
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn malformed_bounds_are_bad_requests() {
        let broker = store(5).await;
        for pairs in [
            &[("start", "x")][..],
            &[("end", "1.5")],
            &[("start", "-1")],
            &[("start", "4"), ("end", "4")],
            &[("start", "5"), ("end", "2")],
        ] {
            assert!(
                matches!(list(&broker, pairs).await, Err(GatewayError::BadRequest(_))),
                "{pairs:?}"
            );
        }
    }

    #[tokio::test]
    async fn timeseries_plugin_answers_back_queries() {
        let broker = MemoryBroker::new();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        for age in (0..10).rev() {
            broker.push_front("k", format!("[{}, {age}]", now - age * 25)).await;
        }
        let chain = ProviderRegistry::builtin().load(&[pubrelay_config::PluginEntry {
            name: "timeseries".into(),
            enabled: true,
            settings: serde_json::json!({"host": "relay://test"}),
        }]);

        // back=2 minutes covers ages 0..=4 at 25 s spacing.
        let body = serve_list(&broker, &chain, "k", params(&[("back", "2")])).await.unwrap();
        let points: Vec<[f64; 2]> = serde_json::from_str(&body).unwrap();
        assert_eq!(points.len(), 5);

        // Without `back` the plugin declines and the default slice answers.
        let body = serve_list(&broker, &chain, "k", params(&[("end", "2")])).await.unwrap();
        let raw: Vec<String> = serde_json::from_str(&body).unwrap();
        assert_eq!(raw.len(), 2);
    }
}
