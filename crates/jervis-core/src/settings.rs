use std::path::PathBuf;

use crate::config::{Config, ConfigError};

/// Manages loading and saving settings to a TOML file on disk.
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    /// Create a new `SettingsManager` that reads/writes the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a `SettingsManager` using the default config location
    /// (`~/.jervis/config.toml`).
    pub fn default_path() -> Self {
        Self {
            path: Config::default_path(),
        }
    }

    /// Load config from the TOML file on disk.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config to the TOML file on disk, creating parent directories if
    /// they don't exist.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = config.to_toml()?;
        std::fs::write(&self.path, text).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Load config from disk, falling back to `Config::default()` when the
    /// file is missing or unparseable.
    pub fn load_or_default(&self) -> Config {
        self.load().unwrap_or_default()
    }

    /// Return the file path this manager reads/writes.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
