//! User configuration persisted in the `meta` table.

use crate::error::{Result, TrackerError};
use crate::store::{meta_keys, Database};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::error;

/// Validated user configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Lowercased, trimmed tag names. Titles carrying one are muted.
    pub tags_blacklist: BTreeSet<String>,

    /// Base URL of the sync server, without a trailing `/`. `None` disables
    /// replication.
    pub sync_server_url: Option<String>,

    pub tweak_card_styles: bool,

    /// Chapters read before a title counts as seen.
    pub chapters_per_title_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tags_blacklist: BTreeSet::new(),
            sync_server_url: None,
            tweak_card_styles: true,
            chapters_per_title_threshold: 2,
        }
    }
}

/// Stored (unvalidated) form of [`Config`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub tags_blacklist: Vec<String>,
    pub sync_server_url: Option<String>,
    pub tweak_card_styles: bool,
    pub chapters_per_title_threshold: i64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Config::default().into()
    }
}

impl From<Config> for RawConfig {
    fn from(config: Config) -> Self {
        Self {
            tags_blacklist: config.tags_blacklist.into_iter().collect(),
            sync_server_url: config.sync_server_url,
            tweak_card_styles: config.tweak_card_styles,
            chapters_per_title_threshold: i64::from(config.chapters_per_title_threshold),
        }
    }
}

/// Normalize and check a raw configuration.
pub fn validate_config(raw: RawConfig) -> Result<Config> {
    let tags_blacklist = raw
        .tags_blacklist
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let sync_server_url = raw
        .sync_server_url
        .as_deref()
        .map(normalize_url)
        .transpose()?;

    let chapters_per_title_threshold = u32::try_from(raw.chapters_per_title_threshold)
        .map_err(|_| {
            TrackerError::InvalidConfig(format!(
                "chaptersPerTitleThreshold out of range: {}",
                raw.chapters_per_title_threshold
            ))
        })?;

    Ok(Config {
        tags_blacklist,
        sync_server_url,
        tweak_card_styles: raw.tweak_card_styles,
        chapters_per_title_threshold,
    })
}

fn normalize_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|e| TrackerError::InvalidConfig(format!("syncServerUrl {:?}: {}", raw, e)))?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Load the stored configuration, with defaults for missing fields.
///
/// An invalid stored configuration is logged and replaced by the defaults,
/// which are written back.
pub fn load_config(db: &Database) -> Result<Config> {
    let mut merged = serde_json::to_value(RawConfig::default())?;
    let stored: Option<Value> = db.meta_get(meta_keys::CONFIG)?;

    if let (Some(Value::Object(stored)), Value::Object(fields)) = (&stored, &mut merged) {
        for (k, v) in stored {
            fields.insert(k.clone(), v.clone());
        }
    }

    let parsed = serde_json::from_value::<RawConfig>(merged)
        .map_err(TrackerError::from)
        .and_then(validate_config);

    match parsed {
        Ok(config) => Ok(config),
        Err(e) => {
            error!(error = %e, stored = ?stored, "ignoring invalid config");
            let config = Config::default();
            write_config(db, &config)?;
            Ok(config)
        }
    }
}

pub fn write_config(db: &Database, config: &Config) -> Result<()> {
    db.meta_put(meta_keys::CONFIG, &RawConfig::from(config.clone()))
}
