//! Configuration loading and validation for the key-management tool.

use std::path::Path;

use anyhow::{Context, Result};
use fields::FieldsConfig;

/// Load configuration from `path`, or from the environment when no file is given.
pub fn load(path: Option<&Path>) -> Result<FieldsConfig> {
    let cfg = match path {
        Some(p) => FieldsConfig::from_file(p)
            .with_context(|| format!("failed to load keytool configuration from {}", p.display()))?,
        None => FieldsConfig::from_env().context("failed to load keytool configuration from environment")?,
    };
    Ok(cfg)
}

/// Commands that touch the keyset store need a store and a file-based
/// protection keyset.
pub fn validate_for_store(cfg: &FieldsConfig) -> Result<()> {
    if cfg.store.is_none() {
        anyhow::bail!("a [store] section is required for keyset store commands");
    }
    let protection = cfg.protection_keyset();
    let keyset = cfg
        .keyset(&protection)
        .with_context(|| format!("protection keyset `{protection}` is not configured"))?;
    if keyset.is_database() {
        anyhow::bail!("protection keyset `{protection}` must be a keyset file");
    }
    Ok(())
}
