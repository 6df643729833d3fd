// src/config.rs

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{HubError, Result};
use crate::registry::{SourceGroup, StaticSourceRegistry};

pub const CONFIG_PATH_ENV: &str = "SAFETY_HUB_CONFIG";
pub const REFRESH_TIMEOUT_ENV: &str = "SAFETY_HUB_REFRESH_TIMEOUT_MS";

const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub enabled: bool,              // Default: true
    pub refresh_timeout_ms: u64,    // Default: 10 seconds
    pub groups: Vec<SourceGroup>,   // Default: no sources
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            enabled: true,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            groups: Vec::new(),
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_CONFIG: HubConfig = HubConfig::default();
}

impl HubConfig {
    pub fn with_groups(groups: Vec<SourceGroup>) -> Self {
        HubConfig {
            groups,
            ..HubConfig::default()
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms.max(1))
    }

    pub fn registry(&self) -> Result<StaticSourceRegistry> {
        StaticSourceRegistry::new(self.groups.clone())
    }

    pub fn from_json(raw: &str, origin: &Path) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| HubError::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| HubError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw, path)?;
        // surfaces duplicate ids at load time
        config.registry()?;
        Ok(config)
    }

    /// Loads the file named by `SAFETY_HUB_CONFIG` (defaults when unset),
    /// then applies `SAFETY_HUB_REFRESH_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from_path(Path::new(&path))?,
            None => DEFAULT_CONFIG.clone(),
        };
        if let Ok(raw) = std::env::var(REFRESH_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.refresh_timeout_ms = ms,
                Err(err) => log::warn!("ignoring {}={:?}: {}", REFRESH_TIMEOUT_ENV, raw, err),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceDescriptor;

    #[test]
    fn defaults_enable_the_hub_with_ten_second_timeout() {
        let config = HubConfig::default();
        assert!(config.enabled);
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        assert!(config.groups.is_empty());
        assert_eq!(*DEFAULT_CONFIG, config);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = HubConfig {
            refresh_timeout_ms: 0,
            ..HubConfig::default()
        };
        assert_eq!(config.refresh_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = HubConfig::from_json(r#"{ "enabled": false }"#, Path::new("inline")).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.refresh_timeout_ms, DEFAULT_REFRESH_TIMEOUT_MS);
    }

    #[test]
    fn parse_errors_name_their_origin() {
        let err = HubConfig::from_json("[1, 2", Path::new("/etc/hub.json")).unwrap_err();
        assert!(err.to_string().contains("/etc/hub.json"));
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let config = HubConfig::with_groups(vec![
            SourceGroup::new("a", vec![SourceDescriptor::new_static("dup")]),
            SourceGroup::new("b", vec![SourceDescriptor::new_static("dup")]),
        ]);
        assert!(matches!(config.registry(), Err(HubError::DuplicateSource(_))));
    }
}
