//! Meshtun Settings
//!
//! JSON settings file around [`MeshtunConfig`](meshtun_core::MeshtunConfig).
//!
//! ## Usage
//!
//! ```no_run
//! use meshtun_settings::Settings;
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! // Modify settings
//! settings.config.fakeip.range = "198.18.0.0/15".to_string();
//!
//! // Save settings
//! settings.save()?;
//! # Ok::<(), meshtun_settings::SettingsError>(())
//! ```

mod config;

pub use config::{NodeSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Per-user configuration directory, `<config dir>/meshtun`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshtun")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
