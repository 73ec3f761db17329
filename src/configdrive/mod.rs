//! Provisioning media read by in-guest agents on first boot.

pub mod iso9660;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{ComputeError, Result};
use crate::types::*;
use iso9660::IsoBuilder;

pub const MAX_USERDATA_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDriveFormat {
    NoCloud,
    OpenStack,
}

#[derive(Debug, Error)]
#[error("unknown config drive format '{0}', expected one of: nocloud, openstack")]
pub struct UnknownFormat(pub String);

impl ConfigDriveFormat {
    pub fn all() -> &'static [ConfigDriveFormat] {
        &[ConfigDriveFormat::NoCloud, ConfigDriveFormat::OpenStack]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigDriveFormat::NoCloud => "nocloud",
            ConfigDriveFormat::OpenStack => "openstack",
        }
    }

    pub fn volume_label(&self) -> &'static str {
        match self {
            ConfigDriveFormat::NoCloud => "cidata",
            ConfigDriveFormat::OpenStack => "config-2",
        }
    }
}

impl fmt::Display for ConfigDriveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigDriveFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ConfigDriveFormat::all()
            .iter()
            .copied()
            .find(|format| format.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

#[derive(Serialize)]
struct NoCloudMetadata<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
    #[serde(rename = "public-keys")]
    public_keys: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct OpenStackKey<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    key_type: &'static str,
    data: &'a str,
}

#[derive(Serialize)]
struct OpenStackMetadata<'a> {
    uuid: String,
    name: &'a str,
    hostname: &'a str,
    launch_index: u32,
    public_keys: BTreeMap<&'a str, &'a str>,
    keys: Vec<OpenStackKey<'a>>,
}

/// A rendered image plus what the VM repository needs to attach it.
#[derive(Debug, Clone)]
pub struct ConfigDrive {
    format: ConfigDriveFormat,
    image: Vec<u8>,
}

impl ConfigDrive {
    pub fn format(&self) -> ConfigDriveFormat {
        self.format
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn size_bytes(&self) -> u64 {
        self.image.len() as u64
    }

    /// Volume descriptor for attaching the uploaded image as a cdrom.
    pub fn attachment(&self, path: &str, device_name: &str) -> VirtualMachineAttachedVolume {
        VirtualMachineAttachedVolume {
            path: path.to_string(),
            device_name: device_name.to_string(),
            device_type: DeviceType::Cdrom,
            format: VolumeFormat::Raw,
            device_bus: DeviceBus::Sata,
            volume_type: VolumeType::File,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigDriveBuilder {
    format: ConfigDriveFormat,
}

impl ConfigDriveBuilder {
    pub fn new(format: ConfigDriveFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ConfigDriveFormat {
        self.format
    }

    pub fn build(&self, instance_id: &str, config: &VirtualMachineConfig) -> Result<ConfigDrive> {
        let hostname = if config.hostname.is_empty() {
            instance_id
        } else {
            config.hostname.as_str()
        };
        validate_hostname(hostname)?;
        if config.userdata.len() > MAX_USERDATA_BYTES {
            return Err(ComputeError::Resource(format!(
                "user data is {} bytes, limit is {}",
                config.userdata.len(),
                MAX_USERDATA_BYTES
            )));
        }

        let public_keys: BTreeMap<&str, &str> = config
            .keys
            .iter()
            .map(|k| (k.name.as_str(), k.value.as_str()))
            .collect();

        let mut iso = IsoBuilder::new(self.format.volume_label())?;
        match self.format {
            ConfigDriveFormat::NoCloud => {
                let metadata = NoCloudMetadata {
                    instance_id,
                    local_hostname: hostname,
                    public_keys,
                };
                iso.add_file("meta-data", to_json(&metadata)?)?;
                iso.add_file("user-data", config.userdata.clone())?;
            }
            ConfigDriveFormat::OpenStack => {
                let metadata = OpenStackMetadata {
                    uuid: Uuid::new_v4().to_string(),
                    name: instance_id,
                    hostname,
                    launch_index: 0,
                    public_keys,
                    keys: config
                        .keys
                        .iter()
                        .map(|k| OpenStackKey {
                            name: &k.name,
                            key_type: "ssh",
                            data: &k.value,
                        })
                        .collect(),
                };
                iso.add_file("openstack/latest/meta_data.json", to_json(&metadata)?)?;
                iso.add_file("openstack/latest/user_data", config.userdata.clone())?;
            }
        }

        let image = iso.build(Utc::now())?;
        debug!(
            format = self.format.as_str(),
            bytes = image.len(),
            "Built config drive for {}",
            instance_id
        );
        Ok(ConfigDrive {
            format: self.format,
            image,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value)
        .map_err(|e| ComputeError::Resource(format!("failed to render config drive metadata: {}", e)))
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if hostname.len() <= 253 && hostname.split('.').all(label_ok) {
        Ok(())
    } else {
        Err(ComputeError::Resource(format!("invalid hostname '{}'", hostname)))
    }
}
