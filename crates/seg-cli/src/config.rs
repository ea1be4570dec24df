//! Configuration loading and management.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use seg_core::{ProximityProvider, SegmenterConfig};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Engine thresholds and the activity rule table.
    #[serde(default)]
    pub segmenter: SegmenterConfig,

    /// Contact and support estimation for recordings that only carry poses.
    #[serde(default)]
    pub proximity: ProximityProvider,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("seg.db"),
            segmenter: SegmenterConfig::default(),
            proximity: ProximityProvider::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, the user config file, `config_path`, then
    /// `SEG_*` environment variables with `__` separating nested keys
    /// (`SEG_SEGMENTER__GAP_TOLERANCE=1.0`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SEG_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for seg.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("seg"))
}

/// Returns the platform-specific data directory for seg.
///
/// On Linux: `~/.local/share/seg`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("seg"))
}
