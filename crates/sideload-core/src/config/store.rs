//! Config store for loading and saving sideload.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{SideloadConfig, parser, paths};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Store at the default location, `<config dir>/sideload/sideload.toml`.
    pub fn from_default_location() -> anyhow::Result<Self> {
        Ok(Self::from_dir(&paths::config_dir()?))
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self::from_path(paths::config_path_in(dir))
    }

    pub fn from_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Load the config, or defaults when the file does not exist.
    pub fn load(&self) -> anyhow::Result<SideloadConfig> {
        if !self.config_path.exists() {
            return Ok(SideloadConfig::new());
        }
        parser::parse_config(&self.config_path)
    }

    pub fn save(&self, config: &SideloadConfig) -> anyhow::Result<()> {
        let content = parser::to_toml(config).context("Failed to serialize config to TOML")?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.config_path, content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;
        Ok(())
    }
}
