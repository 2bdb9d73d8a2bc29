//! Tracing subscriber setup for the `harvester` binary.
//!
//! `RUST_LOG` wins when set; otherwise `[logging].level` from the config
//! file is used as the filter directive.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if present, else `default_directive`.
pub fn env_filter(default_directive: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log filter: '{}'", default_directive)),
    }
}

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init(default_directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive)?)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_parse() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("catalog_harvester=debug,sqlx=warn").is_ok());
    }
}
