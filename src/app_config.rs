//! Module for application configuration settings.
//!
//! The gateway reads a TOML file describing the mount point, handle
//! manager limits, the mounts themselves, and any virtual symlinks to
//! seed at startup. Validation collects every problem into a list so the
//! user fixes the file in one pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use aggfs::handle::HandleConfig;
use aggfs::types::PluginConfig;

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/tmp/aggfs/mnt")
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// Handle manager tunables, in seconds. Zero means the built-in default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HandleSettings {
    pub default_lease_secs: u64,
    pub max_lease_secs: u64,
    pub max_handles: usize,
    pub reap_interval_secs: u64,
}

impl HandleSettings {
    /// Convert to the core configuration, letting zeros fall through to
    /// the manager's defaults.
    #[must_use]
    pub fn to_handle_config(self) -> HandleConfig {
        HandleConfig {
            default_lease: Duration::from_secs(self.default_lease_secs),
            max_lease: Duration::from_secs(self.max_lease_secs),
            max_handles: self.max_handles,
            reap_interval: Duration::from_secs(self.reap_interval_secs),
        }
    }
}

/// One mount: a namespace prefix served by a plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountSettings {
    /// Absolute namespace path.
    pub path: String,
    /// Plugin kind (see the registry).
    pub plugin: String,
    /// Instance name; defaults to the plugin kind.
    #[serde(default)]
    pub name: Option<String>,
    /// Plugin-specific scalar configuration.
    #[serde(default)]
    pub config: PluginConfig,
}

impl MountSettings {
    #[must_use]
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.plugin)
    }
}

/// A virtual symlink seeded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SymlinkSettings {
    pub source: String,
    pub target: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default)]
    pub handles: HandleSettings,

    #[serde(default)]
    pub mounts: Vec<MountSettings>,

    #[serde(default)]
    pub symlinks: Vec<SymlinkSettings>,

    /// Owner presented for every entry; defaults to the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            handles: HandleSettings::default(),
            mounts: vec![MountSettings {
                path: "/scratch".to_owned(),
                plugin: "memory".to_owned(),
                name: None,
                config: PluginConfig::default(),
            }],
            symlinks: Vec::new(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

impl Config {
    /// Load from `path`, or fall back to the built-in default (a single
    /// in-memory scratch mount) when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.mounts.is_empty() {
            problems.push("no mounts configured".to_owned());
        }

        let mut seen_paths: Vec<String> = Vec::new();
        for mount in &self.mounts {
            match aggfs::path::normalize(&mount.path) {
                Ok(normalized) => {
                    if seen_paths.contains(&normalized) {
                        problems.push(format!("duplicate mount path {normalized:?}"));
                    }
                    seen_paths.push(normalized);
                }
                Err(e) => problems.push(format!("invalid mount path {:?}: {e}", mount.path)),
            }
            problems.extend(aggfs::plugins::validate_config(&mount.plugin, &mount.config));
        }

        for link in &self.symlinks {
            if let Err(e) = aggfs::path::normalize(&link.source) {
                problems.push(format!("invalid symlink source {:?}: {e}", link.source));
            }
            if link.target.is_empty() {
                problems.push(format!("symlink {:?} has an empty target", link.source));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"
            mount-point = "/mnt/agg"

            [handles]
            default-lease-secs = 30
            max-handles = 128

            [[mounts]]
            path = "/scratch"
            plugin = "memory"

            [[mounts]]
            path = "/data"
            plugin = "local"
            [mounts.config]
            root = "/srv/data"

            [[symlinks]]
            source = "/scratch/link"
            target = "/data/file"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/mnt/agg"));
        assert_eq!(config.handles.default_lease_secs, 30);
        assert_eq!(config.mounts.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_plugin_key_fails_validation() {
        let raw = r#"
            [[mounts]]
            path = "/data"
            plugin = "local"
            [mounts.config]
            root = "/srv/data"
            shiny = true
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("shiny")));
    }

    #[test]
    fn missing_required_key_fails_validation() {
        let raw = r#"
            [[mounts]]
            path = "/data"
            plugin = "local"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("root")));
    }

    #[test]
    fn duplicate_mounts_fail_validation() {
        let raw = r#"
            [[mounts]]
            path = "/m"
            plugin = "memory"

            [[mounts]]
            path = "/m/"
            plugin = "memory"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
