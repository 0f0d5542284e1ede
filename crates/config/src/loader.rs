use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{env_subst::substitute_env, schema::RelayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "pubrelay.toml",
    "pubrelay.yaml",
    "pubrelay.yml",
    "pubrelay.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load the effective config.
///
/// An explicit path must exist and parse. Without one, the search order is:
/// 1. `./pubrelay.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/pubrelay/pubrelay.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RelayConfig::default()` if no config file is found. A file that
/// exists but does not parse is an error: the relay never starts on a
/// config it could only partly read.
pub fn discover_and_load(explicit: Option<&Path>) -> anyhow::Result<RelayConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match find_config_file(Path::new("."), config_dir().as_deref()) {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            load_config(&path)
        },
        None => {
            debug!("no config file found, using defaults");
            Ok(RelayConfig::default())
        },
    }
}

/// Find the first config file in `local`, then in `global`.
fn find_config_file(local: &Path, global: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(local)
        .chain(global)
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Returns `~/.config/pubrelay/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("pubrelay"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
