use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use {
    anyhow::Context,
    axum::http::{HeaderMap, header::AUTHORIZATION},
    base64::{Engine, engine::general_purpose::STANDARD},
    secrecy::{ExposeSecret, Secret},
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::error::GatewayError;

// ── Types ────────────────────────────────────────────────────────────────────

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(String);

impl Principal {
    pub fn new(user: impl Into<String>) -> Self {
        Self(user.into())
    }

    pub fn user(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type IdentityTable = HashMap<String, Secret<String>>;

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn read_table(path: &Path) -> anyhow::Result<IdentityTable> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read identity file {}", path.display()))?;
    let users: HashMap<String, String> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid identity file {}", path.display()))?;
    Ok(users
        .into_iter()
        .map(|(user, password)| (user, Secret::new(password)))
        .collect())
}

/// Pull `(user, password)` out of an `Authorization: Basic ...` header.
fn basic_credentials(headers: &HeaderMap) -> Result<(String, String), String> {
    let mut values = headers.get_all(AUTHORIZATION).iter();
    let value = values.next().ok_or("missing authorization header")?;
    if values.next().is_some() {
        return Err("multiple authorization headers".into());
    }
    let value = value
        .to_str()
        .map_err(|_| "authorization header is not ascii")?;
    let encoded = match value.split_once(' ') {
        Some(("Basic", rest)) => rest.trim(),
        _ => return Err("not a basic authorization header".into()),
    };
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| format!("bad base64 credentials: {e}"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| "credentials are not utf-8")?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or("credentials lack a ':' separator")?;
    Ok((user.to_string(), password.to_string()))
}

// ── Identity gate ────────────────────────────────────────────────────────────

/// Validates Basic credentials against the users file.
pub struct IdentityGate {
    source: Option<PathBuf>,
    users: RwLock<IdentityTable>,
}

impl IdentityGate {
    /// Load the `{user: password}` table from `path`.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let users = read_table(&path)?;
        info!(path = %path.display(), users = users.len(), "loaded identity table");
        Ok(Self {
            source: Some(path),
            users: RwLock::new(users),
        })
    }

    /// Gate over a fixed table with nothing to reload from.
    pub fn from_pairs<I, U, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let users = pairs
            .into_iter()
            .map(|(u, p)| (u.into(), Secret::new(p.into())))
            .collect();
        Self {
            source: None,
            users: RwLock::new(users),
        }
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Re-read the users file and swap the table. On failure the current
    /// table stays in place.
    pub async fn reload(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.source else {
            return Ok(self.user_count().await);
        };
        let fresh = match read_table(path) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "identity reload failed, keeping previous table");
                return Err(e);
            },
        };
        let count = fresh.len();
        *self.users.write().await = fresh;
        info!(path = %path.display(), users = count, "identity table reloaded");
        Ok(count)
    }

    /// Authenticate a request from its headers.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError> {
        let (user, password) = basic_credentials(headers).map_err(|reason| {
            warn!(%reason, "rejecting credentials");
            GatewayError::Unauthenticated(reason)
        })?;

        let users = self.users.read().await;
        let Some(expected) = users.get(&user) else {
            warn!(principal = %user, "unknown user");
            return Err(GatewayError::Unauthenticated(format!("unknown user {user}")));
        };
        if !safe_equal(&password, expected.expose_secret()) {
            warn!(principal = %user, "password mismatch");
            return Err(GatewayError::Unauthenticated(format!(
                "bad password for {user}"
            )));
        }
        Ok(Principal(user))
    }
}
