//! Configuration persistence.
//!
//! The hardware configuration is stored as a single JSON document so an
//! operator can inspect and edit it by hand between runs. Loading
//! re-validates every field; a file describing an impossible setup is
//! reported as an error rather than silently clamped.

use log::{debug, info, warn};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::types::ChargeControlConfig;

/// Load a configuration from `path`, validating all field ranges.
pub fn load_config(path: impl AsRef<Path>) -> Result<ChargeControlConfig> {
    let text = fs::read_to_string(path.as_ref())?;
    let conf: ChargeControlConfig = serde_json::from_str(&text)?;
    conf.validate()?;
    debug!("configuration loaded from {}", path.as_ref().display());
    Ok(conf)
}

/// Write a configuration to `path` as pretty-printed JSON.
pub fn save_config(path: impl AsRef<Path>, conf: &ChargeControlConfig) -> Result<()> {
    conf.validate()?;
    let text = serde_json::to_string_pretty(conf)?;
    fs::write(path.as_ref(), text)?;
    info!("configuration saved to {}", path.as_ref().display());
    Ok(())
}

/// Write the configuration only when it differs from `baseline` (the value
/// loaded at startup), returning whether a write happened. Keeps shutdown
/// from touching the file's mtime on every run.
pub fn save_if_changed(
    path: impl AsRef<Path>,
    conf: &ChargeControlConfig,
    baseline: &ChargeControlConfig,
) -> Result<bool> {
    if conf == baseline {
        return Ok(false);
    }
    save_config(path, conf)?;
    Ok(true)
}

/// Load `path` if it parses cleanly, otherwise fall back to the defaults.
///
/// A missing file is created with the defaults so the operator has
/// something to edit; an existing file that fails to parse or validate is
/// left untouched for the operator to repair.
pub fn load_or_default(path: impl AsRef<Path>) -> ChargeControlConfig {
    let path = path.as_ref();
    if !path.exists() {
        let conf = ChargeControlConfig::default();
        let _ = save_config(path, &conf);
        return conf;
    }
    match load_config(path) {
        Ok(conf) => conf,
        Err(err) => {
            warn!(
                "unusable configuration at {} ({err}), using defaults",
                path.display()
            );
            ChargeControlConfig::default()
        }
    }
}
