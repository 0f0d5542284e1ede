//! `timeseries`: hop-stamps relayed samples and answers `back=`/`cad=`
//! list queries over `[timestamp, value]` history lists.
//!
//! Outgoing messages are JSON objects encoded as strings. When one carries
//! a `__ds` record, that record is wrapped in a new hop record naming this
//! relay, so a client can follow a sample's path and per-hop latency.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    pubrelay_protocol::routes::LIST_DIR,
    serde::Deserialize,
    serde_json::{Map, Value, json},
    tracing::debug,
};

use crate::{
    api::{Capability, ListLookup, ListRequest},
    window::{collect_since, decimate},
};

pub const NAME: &str = "timeseries";

const STAMP_KEY: &str = "__ds";

type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    /// Overrides the hop label; defaults to `relay://<hostname>`.
    host: Option<String>,
}

pub struct TimeseriesPlugin {
    host: String,
    clock: Clock,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl TimeseriesPlugin {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_clock(host, Arc::new(unix_now))
    }

    pub fn with_clock(host: impl Into<String>, clock: Clock) -> Self {
        Self {
            host: host.into(),
            clock,
        }
    }

    /// Registry factory.
    pub fn factory(settings: &Value) -> anyhow::Result<Box<dyn Capability>> {
        let settings: Settings = if settings.is_null() {
            Settings::default()
        } else {
            serde_json::from_value(settings.clone()).context("invalid timeseries settings")?
        };
        let host = match settings.host {
            Some(host) => host,
            None => {
                let name = hostname::get()
                    .context("cannot resolve hostname")?
                    .to_string_lossy()
                    .into_owned();
                format!("relay://{name}")
            },
        };
        Ok(Box::new(Self::new(host)))
    }
}

#[async_trait]
impl Capability for TimeseriesPlugin {
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn transform(&self, payload: Value) -> anyhow::Result<Value> {
        let Value::String(raw) = &payload else {
            bail!("payload is not a string");
        };
        let mut doc: Map<String, Value> =
            serde_json::from_str(raw).context("payload is not a JSON object")?;

        let Some(prev) = doc.remove(STAMP_KEY) else {
            return Ok(payload);
        };
        let prev_ts = prev
            .get("ts")
            .and_then(Value::as_f64)
            .context("__ds.ts missing or not a number")?;

        let now = (self.clock)();
        doc.insert(
            STAMP_KEY.to_string(),
            json!({
                "host": self.host,
                "prev": prev,
                "rate": 1,
                "tsDelta": now - prev_ts,
                "ts": now,
            }),
        );
        Ok(Value::String(serde_json::to_string(&doc)?))
    }

    async fn serve_list(
        &self,
        req: &ListRequest,
        lookup: &dyn ListLookup,
    ) -> anyhow::Result<Option<String>> {
        if req.dir != LIST_DIR || req.key.is_empty() {
            return Ok(None);
        }
        let Some(back) = req.param("back").and_then(|b| b.parse::<i64>().ok()) else {
            return Ok(None);
        };

        let span = back.saturating_mul(60);
        let limit = ((self.clock)() as i64).saturating_sub(span);
        let mut points = collect_since(lookup, limit).await;
        let collected = points.len();

        if let Some(cad) = req.param("cad").and_then(|c| c.parse::<i64>().ok())
            && cad > 0
            && cad < span
        {
            points = decimate(&points, cad);
        }

        debug!(key = %req.key, back, collected, returned = points.len(), "timeseries list query");
        Ok(Some(serde_json::to_string(&points)?))
    }
}
