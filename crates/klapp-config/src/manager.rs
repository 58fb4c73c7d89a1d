use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "Klapp";
const APP: &str = "KlappSync";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::in_dir(dirs.config_dir())
    }

    /// Config rooted in an explicit directory instead of the platform default.
    pub fn in_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(config_dir)?;

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
        }

        Ok(Self { config_path })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
