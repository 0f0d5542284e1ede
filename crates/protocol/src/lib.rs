//! Wire-level constants shared by the gateway, the plugins and the CLI.
//!
//! Everything a client can observe (route prefixes, header names, the
//! refresh token period, default list bounds) is defined here so the HTTP
//! surface and the list engines agree on one set of values.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

// ── Routes ───────────────────────────────────────────────────────────────────

pub mod routes {
    pub const SUBSCRIBE_DIR: &str = "/sub/";
    pub const LIST_DIR: &str = "/list/";
    pub const PUBLISH_DIR: &str = "/pub/";
    pub const STREAM: &str = "/ws/sub";
    pub const REFRESH: &str = "/refresh";
    pub const HEALTH: &str = "/health";
}

// ── Headers ──────────────────────────────────────────────────────────────────

/// Header carrying the time-based refresh token.
pub const REFRESH_HEADER: &str = "x-relay-auth";

/// The refresh token rotates every this many seconds.
pub const REFRESH_PERIOD_SECS: u64 = 10;

/// Expected refresh token for the given unix time.
pub fn refresh_token(unix_secs: u64) -> String {
    (unix_secs / REFRESH_PERIOD_SECS).to_string()
}

// ── List queries ─────────────────────────────────────────────────────────────

/// Default `[start, end)` bounds for a plain list query.
pub const DEFAULT_LIST_START: i64 = 0;
pub const DEFAULT_LIST_END: i64 = 10;

/// First window size used by the time-window scan.
pub const INITIAL_SCAN_WINDOW: i64 = 100;

// ── Modes ────────────────────────────────────────────────────────────────────

/// Which half of the relay a process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Subscribe,
    Publish,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Publish => "publish",
        }
    }
}
