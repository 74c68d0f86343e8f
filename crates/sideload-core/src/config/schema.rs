//! Configuration schema for sideload.toml
//!
//! ```toml
//! [session]
//! label = "sideload"
//!
//! [session.heartbeat]
//! enabled = true
//! restart_interval_ms = 1000
//! initial_timeout_ms = 30000
//! repeated_timeout_ms = 5000
//!
//! [install]
//! staging_dir = "/var/tmp/sideload"
//! recovery_interval_ms = 100
//! configure_device = false
//! pairing_record_dir = "/home/me/.local/share/sideload/pairing"
//! ```
//!
//! Tables this schema does not know (backend settings, for instance) are
//! kept in [`SideloadConfig::extra`] and written back unchanged.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::paths;
use crate::install::InstallSettings;
use crate::session::{HeartbeatSettings, SessionSettings};

/// Root configuration structure for sideload.toml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SideloadConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host label sent with lockdown handshakes
    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_restart_interval_ms")]
    pub restart_interval_ms: u64,

    #[serde(default = "default_initial_timeout_ms")]
    pub initial_timeout_ms: u64,

    #[serde(default = "default_repeated_timeout_ms")]
    pub repeated_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_interval_ms: default_restart_interval_ms(),
            initial_timeout_ms: default_initial_timeout_ms(),
            repeated_timeout_ms: default_repeated_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Parent of per-run staging directories (defaults to the user cache)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Enable wireless installs while preparing the device
    #[serde(default)]
    pub configure_device: bool,

    /// Where wireless pair records are saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_record_dir: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            recovery_interval_ms: default_recovery_interval_ms(),
            configure_device: false,
            pairing_record_dir: None,
        }
    }
}

fn default_label() -> String {
    "sideload".to_string()
}

fn default_true() -> bool {
    true
}

fn default_restart_interval_ms() -> u64 {
    1000
}

fn default_initial_timeout_ms() -> u64 {
    30_000
}

fn default_repeated_timeout_ms() -> u64 {
    5_000
}

fn default_recovery_interval_ms() -> u64 {
    100
}

impl SideloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.label.trim().is_empty() {
            anyhow::bail!("session.label must not be empty");
        }

        let heartbeat = &self.session.heartbeat;
        for (key, value) in [
            ("session.heartbeat.restart_interval_ms", heartbeat.restart_interval_ms),
            ("session.heartbeat.initial_timeout_ms", heartbeat.initial_timeout_ms),
            ("session.heartbeat.repeated_timeout_ms", heartbeat.repeated_timeout_ms),
            ("install.recovery_interval_ms", self.install.recovery_interval_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", key);
            }
        }

        if heartbeat.initial_timeout_ms < heartbeat.repeated_timeout_ms {
            anyhow::bail!(
                "session.heartbeat.initial_timeout_ms ({}) must not be shorter than repeated_timeout_ms ({})",
                heartbeat.initial_timeout_ms,
                heartbeat.repeated_timeout_ms
            );
        }

        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let heartbeat = &self.session.heartbeat;
        SessionSettings {
            label: self.session.label.clone(),
            heartbeat: HeartbeatSettings {
                enabled: heartbeat.enabled,
                restart_interval: Duration::from_millis(heartbeat.restart_interval_ms),
                initial_timeout: Duration::from_millis(heartbeat.initial_timeout_ms),
                repeated_timeout: Duration::from_millis(heartbeat.repeated_timeout_ms),
            },
        }
    }

    pub fn install_settings(&self) -> InstallSettings {
        InstallSettings {
            staging_root: self
                .install
                .staging_dir
                .clone()
                .unwrap_or_else(paths::default_staging_dir),
            recovery_interval: Duration::from_millis(self.install.recovery_interval_ms),
            configure_device: self.install.configure_device,
            pairing_record_dir: self.install.pairing_record_dir.clone(),
        }
    }

    /// A table this schema does not interpret, deserialized as `T`.
    pub fn extra_table<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<T>> {
        let Some(value) = self.extra.get(name) else {
            return Ok(None);
        };
        let parsed = value
            .clone()
            .try_into()
            .map_err(|e| anyhow::anyhow!("Invalid [{}] table: {}", name, e))?;
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let config = SideloadConfig::new();
        assert_eq!(config.session_settings(), SessionSettings::default());

        let install = config.install_settings();
        assert_eq!(install.recovery_interval, Duration::from_millis(100));
        assert!(!install.configure_device);
        assert_eq!(install.staging_root, paths::default_staging_dir());
    }

    #[test]
    fn validate_rejects_empty_label() {
        let mut config = SideloadConfig::new();
        config.session.label = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut config = SideloadConfig::new();
        config.install.recovery_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("install.recovery_interval_ms"));
    }

    #[test]
    fn validate_rejects_short_initial_timeout() {
        let mut config = SideloadConfig::new();
        config.session.heartbeat.initial_timeout_ms = 1000;
        config.session.heartbeat.repeated_timeout_ms = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_staging_dir_wins() {
        let mut config = SideloadConfig::new();
        config.install.staging_dir = Some(PathBuf::from("/tmp/stage"));
        assert_eq!(
            config.install_settings().staging_root,
            PathBuf::from("/tmp/stage")
        );
    }
}
