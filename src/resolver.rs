//! Input key resolution
//!
//! Pure function over a listing of object keys: find the newest dated
//! positions CSV and the fixed template key. Explicit caller-supplied keys
//! always win and skip the scan entirely.

use anyhow::anyhow;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ReconcileError, Result};

/// Keys one run will read its inputs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInputs {
    pub csv_key: String,
    pub template_key: String,
}

/// Explicit key choices from the caller; `None` means auto-detect.
#[derive(Debug, Clone, Default)]
pub struct ExplicitKeys {
    pub csv_key: Option<String>,
    pub template_key: Option<String>,
}

/// Pick input keys from `object_keys` according to the naming convention.
///
/// CSV selection filters to `{source_prefix}{csv_prefix}*.csv` and takes
/// the lexicographically greatest match; the date stamp in the key is
/// sortable (YYYY-MM-DD), so greatest means most recent.
pub fn resolve(
    object_keys: &[String],
    config: &EngineConfig,
    explicit: &ExplicitKeys,
) -> Result<ResolvedInputs> {
    let csv_key = match &explicit.csv_key {
        Some(key) => {
            debug!("Using caller-supplied CSV key: {}", key);
            key.clone()
        }
        None => latest_csv_key(object_keys, config)?,
    };

    let template_key = match &explicit.template_key {
        Some(key) => {
            debug!("Using caller-supplied template key: {}", key);
            key.clone()
        }
        None => {
            if !object_keys.iter().any(|k| k == &config.template_key) {
                return Err(anyhow!(ReconcileError::InputNotFound(format!(
                    "template {} not present in storage",
                    config.template_key
                ))));
            }
            config.template_key.clone()
        }
    };

    info!("Resolved inputs: csv={}, template={}", csv_key, template_key);
    Ok(ResolvedInputs {
        csv_key,
        template_key,
    })
}

fn latest_csv_key(object_keys: &[String], config: &EngineConfig) -> Result<String> {
    let pattern = format!("{}{}", config.source_prefix, config.csv_prefix);
    let latest = object_keys
        .iter()
        .filter(|k| k.starts_with(&pattern) && k.ends_with(".csv"))
        .max();

    match latest {
        Some(key) => {
            debug!("Latest CSV under {}*.csv: {}", pattern, key);
            Ok(key.clone())
        }
        None => Err(anyhow!(ReconcileError::InputNotFound(format!(
            "no CSV found under {pattern}*.csv"
        )))),
    }
}
