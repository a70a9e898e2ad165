//! Tracker configuration.
//!
//! Every field has a default, so an empty (or missing) file is a valid
//! configuration. Example:
//!
//! ```toml
//! broker_url = "wss://broker.example/ws"
//! share_base = "https://wagashi.example/track"
//!
//! [geolocation]
//! timeout_ms = 10000
//!
//! [route]
//! tick_ms = 500
//! waypoints = [
//!     { latitude = 35.6840, longitude = 139.7745 },
//!     { latitude = 35.6812, longitude = 139.7671 },
//! ]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{RouteConfig, WatchOptions};
use crate::status::StatusConfig;

/// Configuration for one tracker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// WebSocket URL of the connection broker.
    pub broker_url: String,
    /// Prefix of generated driver ids.
    pub id_prefix: String,
    /// Random characters after the prefix.
    pub id_suffix_len: usize,
    /// Origin and path customers open; the delivery id goes in the fragment.
    pub share_base: String,
    pub geolocation: WatchOptions,
    pub status: StatusConfig,
    /// Capacity of the session notice channel.
    pub event_capacity: usize,
    /// Route walked by the simulated position source.
    pub route: RouteConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:9000".to_string(),
            id_prefix: "wagashi-".to_string(),
            id_suffix_len: 6,
            share_base: "http://localhost:5173/".to_string(),
            geolocation: WatchOptions::default(),
            status: StatusConfig::default(),
            event_capacity: 256,
            route: RouteConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Coordinates;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(TrackerConfig::from_toml_str("").unwrap(), TrackerConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = TrackerConfig::from_toml_str(
            r#"
            broker_url = "wss://broker.example/ws"

            [geolocation]
            timeout_ms = 5000

            [status]
            max_chars = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.broker_url, "wss://broker.example/ws");
        assert_eq!(config.id_prefix, "wagashi-");
        assert_eq!(config.geolocation.timeout_ms, 5_000);
        assert!(config.geolocation.high_accuracy);
        assert_eq!(config.status.max_chars, 30);
        assert_eq!(config.status.fallback, StatusConfig::default().fallback);
    }

    #[test]
    fn test_route_waypoints() {
        let config = TrackerConfig::from_toml_str(
            r#"
            [route]
            tick_ms = 250
            waypoints = [
                { latitude = 1.0, longitude = 2.0 },
                { latitude = 3.0, longitude = 4.0 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(config.route.tick_ms, 250);
        assert_eq!(config.route.waypoints[1], Coordinates::new(3.0, 4.0));
        assert_eq!(config.route.steps_between, RouteConfig::default().steps_between);
    }

    #[test]
    fn test_invalid_toml() {
        let err = TrackerConfig::from_toml_str("id_suffix_len = \"six\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id_prefix = \"mochi-\"\nevent_capacity = 16").unwrap();

        let config = TrackerConfig::load(file.path()).unwrap();
        assert_eq!(config.id_prefix, "mochi-");
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrackerConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
