//! Settings file layout

use std::path::{Path, PathBuf};

use meshtun_core::MeshtunConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Tunnel, fake address and network configuration
    #[serde(flatten)]
    pub config: MeshtunConfig,

    /// Local node settings
    #[serde(default)]
    pub node: NodeSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Path this instance was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// Local node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Swarm listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Fraction of system memory the transport may use before refusing
    /// new connections
    #[serde(default = "default_memory_fraction")]
    pub max_memory_fraction: f64,
}

fn default_listen_addr() -> String {
    "/ip4/0.0.0.0/tcp/0".to_string()
}

fn default_memory_fraction() -> f64 {
    0.5
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_memory_fraction: default_memory_fraction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("meshtun-settings-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.config.network.local_addr, "192.168.100.2/24");
        assert!(settings.config.network.endpoints.is_empty());
        assert!(!settings.config.fakeip.is_enabled());
        assert_eq!(settings.node.listen_addr, "/ip4/0.0.0.0/tcp/0");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "fakeip": { "range": "198.18.0.0/15" }, "tunnel": { "port_buffer": 8 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.config.fakeip.range, "198.18.0.0/15");
        assert_eq!(settings.config.tunnel.port_buffer, 8);
        assert_eq!(settings.config.tunnel.inbound_queue, 1);
        assert_eq!(settings.node.max_memory_fraction, 0.5);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = temp_path("missing");
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.config, MeshtunConfig::default());
        assert_eq!(settings.path(), Some(path.as_path()));
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("reload");
        let mut settings = Settings::load_from(&path).unwrap();
        settings.config.network.namespace = "lab".to_string();
        settings.config.network.forward = vec!["10.1.0.0/16".to_string()];
        settings.save().unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.config.network.namespace, "lab");
        assert_eq!(loaded, settings);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let path = temp_path("malformed");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = Settings::load_from(&path).unwrap_err();
        assert!(matches!(err, SettingsError::ParseError(_)));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_default_path_ends_in_meshtun() {
        let path = default_settings_path();
        assert!(path.ends_with("meshtun/settings.json"));
    }
}
