use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::types::*;

pub const CONFIG_NAMESPACE: &str = "https://kvm-compute.dev/xmlns/config/1.0";

static DISK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<disk\b[^>]*>.*?</disk>").unwrap());
static INTERFACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<interface\b[^>]*>.*?</interface>").unwrap());
static VCPUPIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<vcpupin\b[^>]*>").unwrap());
static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<compute:key\s+name=['"]([^'"]*)['"]\s*>(.*?)</compute:key>"#).unwrap()
});

pub struct XmlParser;

impl XmlParser {
    /// Parse the domain description returned by the daemon. State, node and
    /// IP addresses are not part of the XML and are filled in by the caller.
    pub fn parse_domain(xml: &str) -> DomainXmlInfo {
        debug!("Parsing domain XML: {} chars", xml.len());

        let mut info = DomainXmlInfo {
            name: Self::extract_between_tags(xml, "name").unwrap_or_default(),
            ..Default::default()
        };

        info.vcpus = Self::extract_between_tags(xml, "vcpu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if let Some(amount) = Self::extract_between_tags(xml, "memory").and_then(|v| v.parse::<u64>().ok()) {
            let unit = Self::extract_attribute_value(xml, "memory", "unit").unwrap_or_else(|| "KiB".to_string());
            info.memory = Self::size_with_unit(amount, &unit);
        }

        info.arch = Self::extract_attribute_value(xml, "type", "arch")
            .map(|a| Arch::parse(&a))
            .unwrap_or_default();

        info.volumes = DISK_RE
            .find_iter(xml)
            .filter_map(|m| Self::parse_single_disk(m.as_str()))
            .collect();

        info.interfaces = INTERFACE_RE
            .find_iter(xml)
            .filter_map(|m| Self::parse_single_interface(m.as_str()))
            .collect();

        info.graphic = Self::parse_graphic(xml);
        info.guest_agent = xml.contains("org.qemu.guest_agent.0");
        info.has_console = xml.contains("<console ");
        info.cpupin = Self::parse_cpupin(xml);
        info.config = Self::parse_config(xml);

        debug!(
            "Parsed domain: name={}, vcpus={}, memory={}, disks={}, interfaces={}",
            info.name,
            info.vcpus,
            info.memory,
            info.volumes.len(),
            info.interfaces.len()
        );

        info
    }

    fn size_with_unit(amount: u64, unit: &str) -> Size {
        match unit {
            "b" | "bytes" => Size::from_bytes(amount),
            "M" | "MiB" => Size::from_mib(amount),
            "G" | "GiB" => Size::from_gib(amount),
            "MB" => Size::from_bytes(amount.saturating_mul(1_000_000)),
            "GB" => Size::from_bytes(amount.saturating_mul(1_000_000_000)),
            "KB" => Size::from_bytes(amount.saturating_mul(1000)),
            _ => Size::from_kib(amount),
        }
    }

    fn parse_single_disk(disk_xml: &str) -> Option<VirtualMachineAttachedVolume> {
        let device_type = Self::extract_attribute_value(disk_xml, "disk", "device")
            .and_then(|d| DeviceType::parse(&d))?;

        let path = Self::extract_attribute_value(disk_xml, "source", "file")
            .or_else(|| Self::extract_attribute_value(disk_xml, "source", "dev"))
            .map(|p| unescape(&p))
            .unwrap_or_default();

        let device_name = Self::extract_attribute_value(disk_xml, "target", "dev")?;
        let device_bus = Self::extract_attribute_value(disk_xml, "target", "bus")
            .map(|b| DeviceBus::parse(&b))
            .unwrap_or_default();
        let format = Self::extract_attribute_value(disk_xml, "driver", "type")
            .map(|t| VolumeFormat::parse(&t))
            .unwrap_or_default();
        let volume_type = Self::extract_attribute_value(disk_xml, "disk", "type")
            .map(|t| VolumeType::parse(&t))
            .unwrap_or_default();

        Some(VirtualMachineAttachedVolume {
            path,
            device_name,
            device_type,
            format,
            device_bus,
            volume_type,
        })
    }

    fn parse_single_interface(interface_xml: &str) -> Option<VirtualMachineAttachedInterface> {
        let interface_type = Self::extract_attribute_value(interface_xml, "interface", "type")?;

        let (network_type, network_name) = match interface_type.as_str() {
            "bridge" => (
                NetworkType::Bridge,
                Self::extract_attribute_value(interface_xml, "source", "bridge"),
            ),
            "network" => (
                NetworkType::Libvirt,
                Self::extract_attribute_value(interface_xml, "source", "network"),
            ),
            _ => return None,
        };

        Some(VirtualMachineAttachedInterface {
            mac: Self::extract_attribute_value(interface_xml, "mac", "address").unwrap_or_default(),
            network_name: network_name.map(|n| unescape(&n)).unwrap_or_default(),
            network_type,
            model: Self::extract_attribute_value(interface_xml, "model", "type").unwrap_or_default(),
            access_vlan: Self::extract_attribute_value(interface_xml, "tag", "id").and_then(|t| t.parse().ok()),
            ip_address_list: Vec::new(),
        })
    }

    fn parse_graphic(xml: &str) -> VirtualMachineGraphic {
        let Some(graphics_type) = Self::extract_attribute_value(xml, "graphics", "type") else {
            return VirtualMachineGraphic::default();
        };
        VirtualMachineGraphic {
            graphic_type: GraphicType::parse(&graphics_type),
            listen: Self::extract_attribute_value(xml, "graphics", "listen").unwrap_or_default(),
            port: Self::extract_attribute_value(xml, "graphics", "port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(-1),
        }
    }

    fn parse_cpupin(xml: &str) -> Option<VirtualMachineCpuPin> {
        let mut pin = VirtualMachineCpuPin::default();
        for tag in VCPUPIN_RE.find_iter(xml) {
            let tag = tag.as_str();
            let vcpu = Self::extract_attribute_value(tag, "vcpupin", "vcpu").and_then(|v| v.parse().ok());
            let cpuset = Self::extract_attribute_value(tag, "vcpupin", "cpuset");
            if let (Some(vcpu), Some(cpuset)) = (vcpu, cpuset) {
                pin.vcpus.insert(vcpu, parse_cpuset(&cpuset));
            }
        }
        if let Some(cpuset) = Self::extract_attribute_value(xml, "emulatorpin", "cpuset") {
            pin.emulator = parse_cpuset(&cpuset);
        }
        if pin.vcpus.is_empty() && pin.emulator.is_empty() {
            None
        } else {
            Some(pin)
        }
    }

    fn parse_config(xml: &str) -> Option<VirtualMachineConfig> {
        let section = Self::extract_section(xml, "compute:config")?;
        let hostname = Self::extract_between_tags(&section, "compute:hostname")
            .map(|h| unescape(&h))
            .unwrap_or_default();
        let keys = KEY_RE
            .captures_iter(&section)
            .map(|c| Key {
                name: unescape(&c[1]),
                value: unescape(c[2].trim()),
            })
            .collect();
        let userdata = Self::extract_between_tags(&section, "compute:userdata")
            .and_then(|d| STANDARD.decode(d.trim()).ok())
            .unwrap_or_default();
        Some(VirtualMachineConfig {
            hostname,
            keys,
            userdata,
        })
    }

    /// Parse a storage volume description: (format, capacity).
    pub fn parse_volume(xml: &str) -> (VolumeFormat, Size) {
        let format = Self::extract_section(xml, "target")
            .and_then(|target| Self::extract_attribute_value(&target, "format", "type"))
            .map(|f| VolumeFormat::parse(&f))
            .unwrap_or_default();
        let capacity = Self::extract_between_tags(xml, "capacity")
            .and_then(|c| c.parse::<u64>().ok())
            .map(|amount| {
                let unit = Self::extract_attribute_value(xml, "capacity", "unit").unwrap_or_else(|| "bytes".into());
                Self::size_with_unit(amount, &unit)
            })
            .unwrap_or_default();
        (format, capacity)
    }

    fn extract_between_tags(xml: &str, tag: &str) -> Option<String> {
        let pattern = format!(r"(?s)<{}(?:\s[^>]*)?>(.*?)</{}>", regex::escape(tag), regex::escape(tag));
        let regex = Regex::new(&pattern).ok()?;
        regex.captures(xml).map(|c| c[1].trim().to_string())
    }

    fn extract_section(xml: &str, section_name: &str) -> Option<String> {
        let pattern = format!(
            r"(?s)<{}(?:\s[^>]*)?>.*?</{}>",
            regex::escape(section_name),
            regex::escape(section_name)
        );
        let regex = Regex::new(&pattern).ok()?;
        regex.find(xml).map(|m| m.as_str().to_string())
    }

    fn extract_attribute_value(xml: &str, element: &str, attribute: &str) -> Option<String> {
        let pattern = format!(
            r#"<{}\s[^>]*?\b{}=(?:'([^']*)'|"([^"]*)")"#,
            regex::escape(element),
            regex::escape(attribute)
        );
        let regex = Regex::new(&pattern).ok()?;
        let captures = regex.captures(xml)?;
        captures.get(1).or_else(|| captures.get(2)).map(|m| m.as_str().to_string())
    }
}

/// Expands a libvirt cpuset such as `0-2,4,^1` into a sorted list.
pub fn parse_cpuset(cpuset: &str) -> Vec<u32> {
    let mut cpus = std::collections::BTreeSet::new();
    let mut excluded = Vec::new();
    for part in cpuset.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(cpu) = part.strip_prefix('^') {
            if let Ok(cpu) = cpu.parse::<u32>() {
                excluded.push(cpu);
            }
        } else if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<u32>() {
            cpus.insert(cpu);
        }
    }
    for cpu in excluded {
        cpus.remove(&cpu);
    }
    cpus.into_iter().collect()
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[derive(Debug, Default, Clone)]
pub struct DomainXmlInfo {
    pub name: String,
    pub vcpus: u32,
    pub memory: Size,
    pub arch: Arch,
    pub volumes: Vec<VirtualMachineAttachedVolume>,
    pub interfaces: Vec<VirtualMachineAttachedInterface>,
    pub graphic: VirtualMachineGraphic,
    pub guest_agent: bool,
    pub has_console: bool,
    pub cpupin: Option<VirtualMachineCpuPin>,
    pub config: Option<VirtualMachineConfig>,
}

impl DomainXmlInfo {
    pub fn into_machine(self, node_id: &str, state: VmState, autostart: bool) -> VirtualMachine {
        VirtualMachine {
            id: self.name,
            node_id: node_id.to_string(),
            vcpus: self.vcpus,
            arch: self.arch,
            state,
            memory: self.memory,
            interfaces: self.interfaces,
            volumes: self.volumes,
            config: self.config,
            cpupin: self.cpupin,
            guest_agent: self.guest_agent,
            autostart,
            graphic: self.graphic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm' id='3'>
  <name>web-1</name>
  <uuid>7b1f0c56-1c3e-4d7c-9a43-0f1d2c3b4a59</uuid>
  <metadata>
    <compute:config xmlns:compute="https://kvm-compute.dev/xmlns/config/1.0">
      <compute:hostname>web-1.example.com</compute:hostname>
      <compute:key name="ops">ssh-ed25519 AAAAC3 ops@example</compute:key>
      <compute:userdata>I2Nsb3VkLWNvbmZpZw==</compute:userdata>
    </compute:config>
  </metadata>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <cputune>
    <vcpupin vcpu='0' cpuset='2-3'/>
    <vcpupin vcpu='1' cpuset='4,6'/>
    <emulatorpin cpuset='0'/>
  </cputune>
  <os>
    <type arch='x86_64' machine='pc-q35-6.2'>hvm</type>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web-1.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/images/web-1_config.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:12:34:56'/>
      <source bridge='br0'/>
      <vlan>
        <tag id='42'/>
      </vlan>
      <model type='virtio'/>
    </interface>
    <interface type='network'>
      <mac address='52:54:00:ab:cd:ef'/>
      <source network='default'/>
      <model type='e1000'/>
    </interface>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='vnc' port='5901' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
</domain>"#;

    #[test]
    fn parses_identity_and_sizing() {
        let info = XmlParser::parse_domain(DOMAIN);
        assert_eq!(info.name, "web-1");
        assert_eq!(info.vcpus, 2);
        assert_eq!(info.memory.mib(), 2048);
        assert_eq!(info.arch, Arch::X86_64);
        assert!(info.guest_agent);
        assert!(info.has_console);
    }

    #[test]
    fn parses_disks_in_document_order() {
        let info = XmlParser::parse_domain(DOMAIN);
        assert_eq!(info.volumes.len(), 2);
        assert_eq!(info.volumes[0].device_name, "vda");
        assert_eq!(info.volumes[0].format, VolumeFormat::Qcow2);
        assert_eq!(info.volumes[0].device_type, DeviceType::Disk);
        assert_eq!(info.volumes[1].path, "/var/lib/libvirt/images/web-1_config.iso");
        assert_eq!(info.volumes[1].device_type, DeviceType::Cdrom);
        assert_eq!(info.volumes[1].device_bus, DeviceBus::Sata);
    }

    #[test]
    fn parses_interfaces_with_vlan() {
        let info = XmlParser::parse_domain(DOMAIN);
        assert_eq!(info.interfaces.len(), 2);
        let bridged = &info.interfaces[0];
        assert_eq!(bridged.network_type, NetworkType::Bridge);
        assert_eq!(bridged.network_name, "br0");
        assert_eq!(bridged.access_vlan, Some(42));
        let nat = &info.interfaces[1];
        assert_eq!(nat.network_type, NetworkType::Libvirt);
        assert_eq!(nat.mac, "52:54:00:ab:cd:ef");
        assert_eq!(nat.model, "e1000");
        assert_eq!(nat.access_vlan, None);
    }

    #[test]
    fn parses_graphic_and_cpupin() {
        let info = XmlParser::parse_domain(DOMAIN);
        assert!(info.graphic.vnc());
        assert_eq!(info.graphic.port, 5901);
        assert_eq!(info.graphic.listen, "127.0.0.1");

        let pin = info.cpupin.unwrap();
        assert_eq!(pin.vcpus[&0], vec![2, 3]);
        assert_eq!(pin.vcpus[&1], vec![4, 6]);
        assert_eq!(pin.emulator, vec![0]);
    }

    #[test]
    fn parses_config_metadata() {
        let config = XmlParser::parse_domain(DOMAIN).config.unwrap();
        assert_eq!(config.hostname, "web-1.example.com");
        assert_eq!(config.keys.len(), 1);
        assert_eq!(config.keys[0].name, "ops");
        assert_eq!(config.keys[0].value, "ssh-ed25519 AAAAC3 ops@example");
        assert_eq!(config.userdata, b"#cloud-config".to_vec());
    }

    #[test]
    fn minimal_domain_has_no_optional_parts() {
        let xml = "<domain type='kvm'><name>bare</name><memory>1048576</memory><vcpu>1</vcpu><devices></devices></domain>";
        let info = XmlParser::parse_domain(xml);
        assert_eq!(info.memory.mib(), 1024);
        assert!(info.config.is_none());
        assert!(info.cpupin.is_none());
        assert!(info.volumes.is_empty());
        assert_eq!(info.graphic, VirtualMachineGraphic::default());
    }

    #[test]
    fn parses_volume_description() {
        let xml = r#"<volume type='file'>
  <name>root.qcow2</name>
  <capacity unit='bytes'>10737418240</capacity>
  <allocation unit='bytes'>200704</allocation>
  <target>
    <path>/var/lib/libvirt/images/root.qcow2</path>
    <format type='qcow2'/>
  </target>
</volume>"#;
        let (format, capacity) = XmlParser::parse_volume(xml);
        assert_eq!(format, VolumeFormat::Qcow2);
        assert_eq!(capacity.mib(), 10240);
    }

    #[test]
    fn cpuset_ranges_and_exclusions() {
        assert_eq!(parse_cpuset("0-3,^2,8"), vec![0, 1, 3, 8]);
        assert_eq!(parse_cpuset(""), Vec::<u32>::new());
    }

    #[test]
    fn escape_round_trips_markup() {
        let raw = r#"a<b>&'c'"d""#;
        assert_eq!(unescape(&escape(raw)), raw);
    }
}
