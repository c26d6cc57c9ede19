//! Persistent engine configuration.
//!
//! Stores tuning knobs in `~/.livequery/config.json`. Every field has a
//! default, so a partial or missing file is fine.
//!
//! # Example
//!
//! ```no_run
//! use livequery_core::config::EngineConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = EngineConfig::load();
//! println!("coarse watch throttled to {:?}", config.coarse_throttle());
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::ThrottleConfig;

const CONFIG_DIR: &str = ".livequery";
const CONFIG_FILENAME: &str = "config.json";

/// Returns the livequery configuration directory (`~/.livequery`).
pub fn livequery_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

/// Tuning of the live query pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Throttle window of the coarse whole-tree watch, in milliseconds.
    pub coarse_throttle_ms: u64,

    /// Re-evaluate at the start of a throttle window.
    pub coarse_leading: bool,

    /// Re-evaluate at the end of a throttle window that saw changes.
    pub coarse_trailing: bool,

    /// Attributes whose change may alter matches or visibility.
    pub watched_attributes: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coarse_throttle_ms: 100,
            coarse_leading: true,
            coarse_trailing: true,
            watched_attributes: ["class", "style", "hidden"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Load config from `~/.livequery/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&livequery_dir().join(CONFIG_FILENAME))
    }

    /// Load config from `path`, falling back to [`Default`].
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.livequery/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = livequery_dir();
        std::fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(CONFIG_FILENAME))
    }

    /// Save config to `path`.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    /// Throttle applied to the coarse whole-tree watch.
    pub fn coarse_throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            window: Duration::from_millis(self.coarse_throttle_ms),
            leading: self.coarse_leading,
            trailing: self.coarse_trailing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.coarse_throttle_ms, 100);
        assert!(config.coarse_leading && config.coarse_trailing);
        assert!(config.watched_attributes.contains("hidden"));
        assert_eq!(config.coarse_throttle(), ThrottleConfig::both(Duration::from_millis(100)));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let loaded: EngineConfig = serde_json::from_str(r#"{"coarse_leading": false}"#).unwrap();
        assert!(!loaded.coarse_leading);
        assert_eq!(loaded.coarse_throttle_ms, 100);
        assert_eq!(loaded.watched_attributes.len(), 3);
    }

    #[test]
    fn roundtrip_through_file() {
        let path = std::env::temp_dir().join(format!("livequery-config-{}.json", std::process::id()));
        let config = EngineConfig {
            coarse_throttle_ms: 250,
            watched_attributes: ["aria-hidden".to_string()].into_iter().collect(),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_from_missing_or_invalid_file_returns_default() {
        let missing = std::env::temp_dir().join("livequery-config-does-not-exist.json");
        assert_eq!(EngineConfig::load_from(&missing), EngineConfig::default());

        let garbage = std::env::temp_dir().join(format!("livequery-garbage-{}.json", std::process::id()));
        std::fs::write(&garbage, "not json").unwrap();
        assert_eq!(EngineConfig::load_from(&garbage), EngineConfig::default());
        std::fs::remove_file(&garbage).ok();
    }
}
