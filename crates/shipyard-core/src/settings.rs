//! Operator settings for shipyard.
//!
//! Settings live in `~/.config/shipyard/settings.toml` unless a path is given
//! explicitly. Every field has a default, so a missing file is a valid
//! configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::port::DEFAULT_BASE_PORT;

/// Where compiled applications are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildLocation {
    /// Build on every server after staging.
    #[default]
    Remote,
    /// Build once in the scratch tree, then ship the binary.
    Local,
}

/// Write discipline for the shared proxy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Consistency {
    /// Load, mutate, save. Concurrent writers from other runs may overwrite
    /// each other.
    #[default]
    LastWriteWins,
    /// Re-read the document before writing and retry the mutation when it
    /// changed since it was loaded.
    CheckRevision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Canonical routing document on every proxy node.
    pub document_path: String,
    /// Load-balancer configuration rendered from the document.
    pub rendered_path: String,
    /// Service reloaded after each write.
    pub service: String,
    /// Frontend bind address in the rendered configuration.
    pub bind: String,
    pub consistency: Consistency,
    pub max_conflict_retries: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            document_path: "/etc/haproxy/config.json".to_string(),
            rendered_path: "/etc/haproxy/haproxy.cfg".to_string(),
            service: "haproxy".to_string(),
            bind: "*:80".to_string(),
            consistency: Consistency::LastWriteWins,
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Directory for control-master sockets (defaults to the temp dir).
    pub control_dir: Option<PathBuf>,
    /// Extra `-o` style arguments passed to every ssh invocation.
    pub extra_args: Vec<String>,
}

/// Root settings structure for settings.toml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Parent of every application directory on the servers.
    pub remote_root: String,
    /// Where unit files are installed.
    pub unit_dir: String,
    pub base_port: u16,
    pub service_user: String,
    pub service_group: String,
    /// Deploy into `<root>/<app>/<environment>` and name the unit
    /// `<app>-<environment>` instead of `<root>/<app>/current`.
    pub environment_in_path: bool,
    pub build_location: BuildLocation,
    /// Remove compiled-language sources from `current` after the swap.
    pub prune_sources: bool,
    pub proxy: ProxySettings,
    pub ssh: SshSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_root: "/opt".to_string(),
            unit_dir: "/etc/systemd/system".to_string(),
            base_port: DEFAULT_BASE_PORT,
            service_user: "fedora".to_string(),
            service_group: "fedora".to_string(),
            environment_in_path: false,
            build_location: BuildLocation::Remote,
            prune_sources: true,
            proxy: ProxySettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("remote_root", &self.remote_root),
            ("unit_dir", &self.unit_dir),
            ("proxy.document_path", &self.proxy.document_path),
            ("proxy.rendered_path", &self.proxy.rendered_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidSetting {
                    key: key.to_string(),
                    message: format!("'{}' must be an absolute path", value),
                });
            }
        }
        if self.base_port == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "base_port".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.proxy.service.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "proxy.service".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads and saves settings.toml.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store at the per-user default location.
    pub fn from_default_location() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("shipyard");
        Ok(Self::from_path(dir.join("settings.toml")))
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings file: {}", self.path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", self.path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(settings).context("Failed to serialize settings to TOML")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write settings file: {}", self.path.display()))?;
        Ok(())
    }
}
