use std::{fmt::Write, path::Path};

use pubrelay_config::{RelayConfig, discover_and_load};

/// Effective config as TOML, followed by what the relay would infer from it.
/// The broker password is never printed.
pub fn render(config: &RelayConfig) -> anyhow::Result<String> {
    let mut out = toml::to_string_pretty(config)?;
    let password = if config.broker.resolve_password().is_some() {
        "set (redacted)"
    } else {
        "not set"
    };
    let mode = if config.publish.channels_file.exists() {
        "publish"
    } else {
        "subscribe"
    };
    writeln!(out, "\n# broker password: {password}")?;
    writeln!(out, "# mode: {mode}")?;
    Ok(out)
}

pub fn check_config(explicit: Option<&Path>) -> anyhow::Result<()> {
    let config = discover_and_load(explicit)?;
    print!("{}", render(&config)?);
    Ok(())
}
