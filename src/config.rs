use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configdrive::{ConfigDriveFormat, UnknownFormat};
use crate::pool::PoolSettings;
use crate::types::{Arch, VolumeMetadata};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownConfigDriveFormat(#[from] UnknownFormat),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
    pub node: String,
    pub max_connections: usize,
    pub acquire_timeout_secs: u64,
    pub config_drive_pool: String,
    pub config_drive_suffix: String,
    pub config_drive_write_format: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        let pool = PoolSettings::default();
        Self {
            uri: "qemu:///system".to_string(),
            node: "localhost".to_string(),
            max_connections: pool.max_connections,
            acquire_timeout_secs: pool.acquire_timeout.as_secs(),
            config_drive_pool: "default".to_string(),
            config_drive_suffix: "_config.iso".to_string(),
            config_drive_write_format: ConfigDriveFormat::NoCloud.as_str().to_string(),
        }
    }
}

/// Metadata for a known image volume, keyed by its path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub path: String,
    pub os_name: String,
    pub os_version: String,
    pub os_arch: String,
    pub protected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub event: String,
    pub script: PathBuf,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub libvirt: LibvirtConfig,
    pub images: Vec<ImageConfig>,
    pub bridges: Vec<String>,
    pub subscribes: Vec<SubscriptionConfig>,
    pub handler_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libvirt: LibvirtConfig::default(),
            images: Vec::new(),
            bridges: Vec::new(),
            subscribes: Vec::new(),
            handler_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config_drive_format()?;
        if self.libvirt.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "libvirt.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.libvirt.node.is_empty() {
            return Err(ConfigError::Invalid {
                field: "libvirt.node",
                reason: "must not be empty".to_string(),
            });
        }
        if self.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "handler_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(image) = self.images.iter().find(|i| i.path.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "images.path",
                reason: format!("image '{}' has no path", image.os_name),
            });
        }
        Ok(())
    }

    pub fn config_drive_format(&self) -> Result<ConfigDriveFormat, ConfigError> {
        Ok(self.libvirt.config_drive_write_format.parse()?)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.libvirt.max_connections,
            acquire_timeout: Duration::from_secs(self.libvirt.acquire_timeout_secs),
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn volume_metadata(&self) -> HashMap<String, VolumeMetadata> {
        self.images
            .iter()
            .map(|image| {
                (
                    image.path.clone(),
                    VolumeMetadata {
                        os_name: image.os_name.clone(),
                        os_version: image.os_version.clone(),
                        os_arch: Arch::parse(&image.os_arch),
                        protected: image.protected,
                    },
                )
            })
            .collect()
    }
}
