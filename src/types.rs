use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::{ComputeError, Result};

/// Byte-exact size; libvirt reports memory in KiB and volumes in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Size(u64);

impl Size {
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * 1024;
    pub const GIB: u64 = 1024 * 1024 * 1024;

    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Saturates at `u64::MAX` bytes.
    pub fn from_kib(kib: u64) -> Self {
        Self(kib.saturating_mul(Self::KIB))
    }

    /// Saturates at `u64::MAX` bytes.
    pub fn from_mib(mib: u64) -> Self {
        Self(mib.saturating_mul(Self::MIB))
    }

    /// Saturates at `u64::MAX` bytes.
    pub fn from_gib(gib: u64) -> Self {
        Self(gib.saturating_mul(Self::GIB))
    }

    /// Caller-supplied sizes; rejects values that do not fit in bytes.
    pub fn try_from_mib(mib: u64) -> Result<Self> {
        mib.checked_mul(Self::MIB)
            .map(Self)
            .ok_or_else(|| ComputeError::Validation(format!("{} MiB is too large", mib)))
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn kib(&self) -> u64 {
        self.0 / Self::KIB
    }

    pub fn mib(&self) -> u64 {
        self.0 / Self::MIB
    }

    pub fn gib(&self) -> u64 {
        self.0 / Self::GIB
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= Self::GIB && self.0 % Self::GIB == 0 {
            write!(f, "{}GiB", self.gib())
        } else if self.0 >= Self::MIB && self.0 % Self::MIB == 0 {
            write!(f, "{}MiB", self.mib())
        } else if self.0 >= Self::KIB && self.0 % Self::KIB == 0 {
            write!(f, "{}KiB", self.kib())
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[default]
    Unknown,
    X86_64,
    I686,
    Aarch64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i686",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Lenient parse used for configuration and daemon data; unrecognized
    /// names map to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Arch::X86_64,
            "i686" | "i386" | "x86" => Arch::I686,
            "aarch64" | "arm64" => Arch::Aarch64,
            _ => Arch::Unknown,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    #[default]
    Unknown,
    Stopped,
    Running,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VmState::Unknown => "unknown",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeFormat {
    #[default]
    Unknown,
    Raw,
    Qcow2,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Unknown => "unknown",
            VolumeFormat::Raw => "raw",
            VolumeFormat::Qcow2 => "qcow2",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" | "iso" => VolumeFormat::Raw,
            "qcow2" => VolumeFormat::Qcow2,
            _ => VolumeFormat::Unknown,
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing of a volume: an image file or a host block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    #[default]
    File,
    Block,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::File => "file",
            VolumeType::Block => "block",
        }
    }

    /// Reads the `type` attribute of a domain `<disk>`; anything but
    /// `block` is treated as a file.
    pub fn parse(value: &str) -> Self {
        match value {
            "block" => VolumeType::Block,
            _ => VolumeType::File,
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Disk,
    Cdrom,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Disk => "disk",
            DeviceType::Cdrom => "cdrom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disk" => Some(DeviceType::Disk),
            "cdrom" => Some(DeviceType::Cdrom),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBus {
    #[default]
    Virtio,
    Ide,
    Sata,
    Scsi,
}

impl DeviceBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceBus::Virtio => "virtio",
            DeviceBus::Ide => "ide",
            DeviceBus::Sata => "sata",
            DeviceBus::Scsi => "scsi",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "ide" => DeviceBus::Ide,
            "sata" => DeviceBus::Sata,
            "scsi" => DeviceBus::Scsi,
            _ => DeviceBus::Virtio,
        }
    }

    /// Target device prefix the daemon expects for this bus.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DeviceBus::Virtio => "vd",
            DeviceBus::Ide => "hd",
            DeviceBus::Sata | DeviceBus::Scsi => "sd",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Libvirt,
    Bridge,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Libvirt => "libvirt",
            NetworkType::Bridge => "bridge",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphicType {
    #[default]
    None,
    Vnc,
    Spice,
}

impl GraphicType {
    pub fn parse(value: &str) -> Self {
        match value {
            "vnc" => GraphicType::Vnc,
            "spice" => GraphicType::Spice,
            _ => GraphicType::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineGraphic {
    pub graphic_type: GraphicType,
    pub listen: String,
    /// Negative while the daemon has not allocated an autoport.
    pub port: i32,
}

impl VirtualMachineGraphic {
    pub fn vnc(&self) -> bool {
        self.graphic_type == GraphicType::Vnc
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineCpuPin {
    pub vcpus: BTreeMap<u32, Vec<u32>>,
    pub emulator: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineConfig {
    pub hostname: String,
    pub keys: Vec<Key>,
    pub userdata: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineAttachedVolume {
    pub path: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub format: VolumeFormat,
    pub device_bus: DeviceBus,
    #[serde(default)]
    pub volume_type: VolumeType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineAttachedInterface {
    pub mac: String,
    pub network_name: String,
    pub network_type: NetworkType,
    pub model: String,
    pub access_vlan: Option<u16>,
    pub ip_address_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub node_id: String,
    pub vcpus: u32,
    pub arch: Arch,
    pub state: VmState,
    pub memory: Size,
    pub interfaces: Vec<VirtualMachineAttachedInterface>,
    pub volumes: Vec<VirtualMachineAttachedVolume>,
    pub config: Option<VirtualMachineConfig>,
    pub cpupin: Option<VirtualMachineCpuPin>,
    pub guest_agent: bool,
    pub autostart: bool,
    pub graphic: VirtualMachineGraphic,
}

impl VirtualMachine {
    pub fn memory_mib(&self) -> u64 {
        self.memory.mib()
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }

    pub fn attachment_info(&self, path: &str) -> Option<&VirtualMachineAttachedVolume> {
        self.volumes.iter().find(|v| v.path == path)
    }

    pub fn ip_address_list(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.ip_address_list.iter().cloned())
            .collect()
    }

    pub fn disks(&self) -> Vec<&VirtualMachineAttachedVolume> {
        self.volumes
            .iter()
            .filter(|v| v.device_type == DeviceType::Disk)
            .collect()
    }

    pub fn cdroms(&self) -> Vec<&VirtualMachineAttachedVolume> {
        self.volumes
            .iter()
            .filter(|v| v.device_type == DeviceType::Cdrom)
            .collect()
    }
}

/// Everything `create` needs to define a new domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachineCreateParams {
    pub id: String,
    pub node: String,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory: Size,
    pub volumes: Vec<VirtualMachineAttachedVolume>,
    pub interfaces: Vec<VirtualMachineAttachedInterface>,
    pub config: Option<VirtualMachineConfig>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualMachineUpdateParams {
    pub vcpus: Option<u32>,
    pub memory: Option<Size>,
    pub autostart: Option<bool>,
    pub guest_agent: Option<bool>,
}

impl VirtualMachineUpdateParams {
    pub fn is_empty(&self) -> bool {
        self.vcpus.is_none()
            && self.memory.is_none()
            && self.autostart.is_none()
            && self.guest_agent.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub os_name: String,
    pub os_version: String,
    pub os_arch: Arch,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub path: String,
    /// MiB
    pub size: u64,
    pub pool: String,
    pub format: VolumeFormat,
    #[serde(default)]
    pub volume_type: VolumeType,
    pub attached_to: Option<String>,
    pub metadata: VolumeMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePool {
    pub name: String,
    /// MiB
    pub size: u64,
    pub used: u64,
    pub free: u64,
}

impl VolumePool {
    pub fn usage_percent(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        100 * self.used / self.size
    }

    pub fn free_gb(&self) -> u64 {
        self.free / 1024
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub hypervisor: String,
    pub hypervisor_version: String,
    pub cpu_model: String,
    pub cpus: u32,
    pub memory_total_mib: u64,
    pub memory_free_mib: u64,
    pub active_vms: u32,
    pub inactive_vms: u32,
}

impl FromStr for VolumeFormat {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self> {
        match VolumeFormat::parse(s) {
            VolumeFormat::Unknown => Err(ComputeError::Validation(format!(
                "unknown volume format '{}'",
                s
            ))),
            format => Ok(format),
        }
    }
}

/// Rejects duplicate device names among volumes and duplicate MACs among
/// interfaces. MACs compare case-insensitively; empty MACs are skipped since
/// they are generated later.
pub fn validate_attachments(
    volumes: &[VirtualMachineAttachedVolume],
    interfaces: &[VirtualMachineAttachedInterface],
) -> Result<()> {
    let mut devices = HashSet::new();
    for volume in volumes {
        if volume.device_name.is_empty() {
            return Err(ComputeError::Validation(format!(
                "volume {} has no device name",
                volume.path
            )));
        }
        if !devices.insert(volume.device_name.as_str()) {
            return Err(ComputeError::Validation(format!(
                "device name {} used more than once",
                volume.device_name
            )));
        }
    }

    let mut macs = HashSet::new();
    for iface in interfaces.iter().filter(|i| !i.mac.is_empty()) {
        if !macs.insert(iface.mac.to_ascii_lowercase()) {
            return Err(ComputeError::Validation(format!(
                "mac address {} used more than once",
                iface.mac
            )));
        }
    }
    Ok(())
}

/// Locally administered QEMU-range MAC (`52:54:00:xx:xx:xx`).
pub fn generate_mac() -> String {
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

/// First `<prefix><letter>` not present in `used`.
pub fn next_device_name<'a>(prefix: &str, used: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let used: HashSet<&str> = used.into_iter().collect();
    ('a'..='z')
        .map(|c| format!("{}{}", prefix, c))
        .find(|name| !used.contains(name.as_str()))
        .ok_or_else(|| ComputeError::Resource(format!("no free {}* device names left", prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(path: &str, device: &str) -> VirtualMachineAttachedVolume {
        VirtualMachineAttachedVolume {
            path: path.to_string(),
            device_name: device.to_string(),
            device_type: DeviceType::Disk,
            format: VolumeFormat::Qcow2,
            device_bus: DeviceBus::Virtio,
            volume_type: VolumeType::File,
        }
    }

    #[test]
    fn usage_percent_is_relative_to_pool_size() {
        let pool = VolumePool {
            name: "default".into(),
            size: 100,
            used: 50,
            free: 50,
        };
        assert_eq!(pool.usage_percent(), 50);

        let nearly_full = VolumePool {
            name: "default".into(),
            size: 100,
            used: 90,
            free: 10,
        };
        assert_eq!(nearly_full.usage_percent(), 90);
    }

    #[test]
    fn usage_percent_of_empty_pool_is_zero() {
        let pool = VolumePool {
            name: "empty".into(),
            size: 0,
            used: 0,
            free: 0,
        };
        assert_eq!(pool.usage_percent(), 0);
    }

    #[test]
    fn free_gb_truncates() {
        let pool = VolumePool {
            name: "p".into(),
            size: 4096,
            used: 1024,
            free: 3000,
        };
        assert_eq!(pool.free_gb(), 2);
    }

    #[test]
    fn size_conversions() {
        let size = Size::from_mib(2048);
        assert_eq!(size.gib(), 2);
        assert_eq!(size.kib(), 2048 * 1024);
        assert_eq!(size.to_string(), "2GiB");
        assert_eq!(Size::from_kib(1536).to_string(), "1536KiB");
    }

    #[test]
    fn oversized_sizes_do_not_wrap() {
        assert_eq!(Size::from_mib(u64::MAX).bytes(), u64::MAX);
        assert_eq!(Size::from_gib(u64::MAX / 2).bytes(), u64::MAX);
        assert!(matches!(Size::try_from_mib(u64::MAX), Err(ComputeError::Validation(_))));
        assert_eq!(Size::try_from_mib(10).unwrap(), Size::from_mib(10));
    }

    #[test]
    fn duplicate_device_names_are_rejected() {
        let volumes = vec![volume("/a.img", "vda"), volume("/b.img", "vda")];
        let err = validate_attachments(&volumes, &[]).unwrap_err();
        assert!(matches!(err, ComputeError::Validation(_)));
    }

    #[test]
    fn duplicate_macs_are_rejected_case_insensitively() {
        let ifaces = vec![
            VirtualMachineAttachedInterface {
                mac: "52:54:00:AA:BB:CC".into(),
                network_name: "default".into(),
                ..Default::default()
            },
            VirtualMachineAttachedInterface {
                mac: "52:54:00:aa:bb:cc".into(),
                network_name: "default".into(),
                ..Default::default()
            },
        ];
        assert!(matches!(
            validate_attachments(&[], &ifaces),
            Err(ComputeError::Validation(_))
        ));
    }

    #[test]
    fn empty_macs_do_not_collide() {
        let ifaces = vec![
            VirtualMachineAttachedInterface::default(),
            VirtualMachineAttachedInterface::default(),
        ];
        assert!(validate_attachments(&[], &ifaces).is_ok());
    }

    #[test]
    fn next_device_name_skips_used() {
        let name = next_device_name("sd", ["sda", "sdb"]).unwrap();
        assert_eq!(name, "sdc");
    }

    #[test]
    fn generated_macs_use_qemu_prefix() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn arch_parse_accepts_aliases() {
        assert_eq!(Arch::parse("amd64"), Arch::X86_64);
        assert_eq!(Arch::parse("arm64"), Arch::Aarch64);
        assert_eq!(Arch::parse("sparc"), Arch::Unknown);
    }

    #[test]
    fn machine_helpers_split_disks_and_cdroms() {
        let mut cdrom = volume("/cfg.iso", "sda");
        cdrom.device_type = DeviceType::Cdrom;
        let vm = VirtualMachine {
            id: "web".into(),
            node_id: "node1".into(),
            vcpus: 1,
            arch: Arch::X86_64,
            state: VmState::Running,
            memory: Size::from_mib(512),
            interfaces: vec![VirtualMachineAttachedInterface {
                ip_address_list: vec!["10.0.0.2".into()],
                ..Default::default()
            }],
            volumes: vec![volume("/root.img", "vda"), cdrom],
            config: None,
            cpupin: None,
            guest_agent: false,
            autostart: false,
            graphic: VirtualMachineGraphic::default(),
        };
        assert_eq!(vm.disks().len(), 1);
        assert_eq!(vm.cdroms().len(), 1);
        assert_eq!(vm.attachment_info("/cfg.iso").unwrap().device_name, "sda");
        assert_eq!(vm.ip_address_list(), vec!["10.0.0.2".to_string()]);
        assert_eq!(vm.memory_mib(), 512);
        assert!(vm.is_running());
    }
}
