//! Domain, disk and interface definitions sent to the daemon.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::types::*;
use crate::xml_parser::{escape, CONFIG_NAMESPACE};

pub const GUEST_AGENT_CHANNEL: &str = "<channel type='unix'>
  <target type='virtio' name='org.qemu.guest_agent.0'/>
</channel>";

pub struct DomainDefinition<'a> {
    pub id: &'a str,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory: Size,
    pub volumes: &'a [VirtualMachineAttachedVolume],
    pub interfaces: &'a [VirtualMachineAttachedInterface],
    pub config: Option<&'a VirtualMachineConfig>,
    pub guest_agent: bool,
}

impl DomainDefinition<'_> {
    pub fn render(&self) -> String {
        let arch = match self.arch {
            Arch::Unknown => Arch::X86_64,
            arch => arch,
        };

        let metadata = self.config.map(config_metadata_xml).unwrap_or_default();
        let disks: String = self.volumes.iter().map(|v| indent(&disk_xml(v), 4)).collect();
        let interfaces: String = self.interfaces.iter().map(|i| indent(&interface_xml(i), 4)).collect();
        let agent = if self.guest_agent {
            indent(GUEST_AGENT_CHANNEL, 4)
        } else {
            String::new()
        };

        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
{metadata}  <memory unit='KiB'>{memory}</memory>
  <currentMemory unit='KiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='{arch}'>hvm</type>
    <boot dev='hd'/>
    <boot dev='cdrom'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-model' check='partial'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
{disks}{interfaces}    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
{agent}    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
    <video>
      <model type='virtio' heads='1' primary='yes'/>
    </video>
    <memballoon model='virtio'/>
  </devices>
</domain>"#,
            name = escape(self.id),
            metadata = metadata,
            memory = self.memory.kib(),
            vcpus = self.vcpus,
            arch = arch.as_str(),
            disks = disks,
            interfaces = interfaces,
            agent = agent,
        )
    }
}

pub fn disk_xml(volume: &VirtualMachineAttachedVolume) -> String {
    let driver_type = match volume.format {
        VolumeFormat::Qcow2 => "qcow2",
        VolumeFormat::Raw | VolumeFormat::Unknown => "raw",
    };
    let source_attr = match volume.volume_type {
        VolumeType::Block => "dev",
        VolumeType::File => "file",
    };
    let readonly = if volume.device_type == DeviceType::Cdrom {
        "\n  <readonly/>"
    } else {
        ""
    };
    format!(
        "<disk type='{}' device='{}'>\n  <driver name='qemu' type='{}'/>\n  <source {}='{}'/>\n  <target dev='{}' bus='{}'/>{}\n</disk>\n",
        volume.volume_type.as_str(),
        volume.device_type.as_str(),
        driver_type,
        source_attr,
        escape(&volume.path),
        escape(&volume.device_name),
        volume.device_bus.as_str(),
        readonly,
    )
}

pub fn interface_xml(iface: &VirtualMachineAttachedInterface) -> String {
    let (kind, source) = match iface.network_type {
        NetworkType::Bridge => ("bridge", format!("<source bridge='{}'/>", escape(&iface.network_name))),
        NetworkType::Libvirt => ("network", format!("<source network='{}'/>", escape(&iface.network_name))),
    };
    let vlan = iface
        .access_vlan
        .map(|tag| format!("\n  <vlan>\n    <tag id='{}'/>\n  </vlan>", tag))
        .unwrap_or_default();
    let model = if iface.model.is_empty() { "virtio" } else { iface.model.as_str() };
    format!(
        "<interface type='{}'>\n  <mac address='{}'/>\n  {}{}\n  <model type='{}'/>\n</interface>\n",
        kind,
        escape(&iface.mac),
        source,
        vlan,
        escape(model),
    )
}

fn config_metadata_xml(config: &VirtualMachineConfig) -> String {
    let keys: String = config
        .keys
        .iter()
        .map(|k| format!("      <compute:key name='{}'>{}</compute:key>\n", escape(&k.name), escape(&k.value)))
        .collect();
    format!(
        "  <metadata>\n    <compute:config xmlns:compute='{}'>\n      <compute:hostname>{}</compute:hostname>\n{}      <compute:userdata>{}</compute:userdata>\n    </compute:config>\n  </metadata>\n",
        CONFIG_NAMESPACE,
        escape(&config.hostname),
        keys,
        STANDARD.encode(&config.userdata),
    )
}

fn indent(block: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    block
        .lines()
        .map(|line| format!("{}{}\n", pad, line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml_parser::XmlParser;

    fn sample_volumes() -> Vec<VirtualMachineAttachedVolume> {
        vec![
            VirtualMachineAttachedVolume {
                path: "/var/lib/libvirt/images/db.qcow2".into(),
                device_name: "vda".into(),
                device_type: DeviceType::Disk,
                format: VolumeFormat::Qcow2,
                device_bus: DeviceBus::Virtio,
                volume_type: VolumeType::File,
            },
            VirtualMachineAttachedVolume {
                path: "/var/lib/libvirt/images/db_config.iso".into(),
                device_name: "sda".into(),
                device_type: DeviceType::Cdrom,
                format: VolumeFormat::Raw,
                device_bus: DeviceBus::Sata,
                volume_type: VolumeType::File,
            },
        ]
    }

    fn sample_interfaces() -> Vec<VirtualMachineAttachedInterface> {
        vec![VirtualMachineAttachedInterface {
            mac: "52:54:00:00:00:01".into(),
            network_name: "br-data".into(),
            network_type: NetworkType::Bridge,
            model: String::new(),
            access_vlan: Some(300),
            ip_address_list: Vec::new(),
        }]
    }

    #[test]
    fn rendered_domain_parses_back_to_the_same_shape() {
        let volumes = sample_volumes();
        let interfaces = sample_interfaces();
        let config = VirtualMachineConfig {
            hostname: "db<1>".into(),
            keys: vec![Key {
                name: "admin".into(),
                value: "ssh-rsa AAAA admin@host".into(),
            }],
            userdata: b"#!/bin/sh\necho 'hi' > /tmp/x\n".to_vec(),
        };
        let xml = DomainDefinition {
            id: "db",
            arch: Arch::X86_64,
            vcpus: 4,
            memory: Size::from_gib(8),
            volumes: &volumes,
            interfaces: &interfaces,
            config: Some(&config),
            guest_agent: true,
        }
        .render();

        let info = XmlParser::parse_domain(&xml);
        assert_eq!(info.name, "db");
        assert_eq!(info.vcpus, 4);
        assert_eq!(info.memory, Size::from_gib(8));
        assert_eq!(info.volumes, volumes);
        assert_eq!(info.interfaces[0].access_vlan, Some(300));
        assert_eq!(info.interfaces[0].model, "virtio");
        assert!(info.guest_agent);
        assert!(info.has_console);
        assert_eq!(info.config, Some(config));
    }

    #[test]
    fn domain_without_config_has_no_metadata() {
        let xml = DomainDefinition {
            id: "plain",
            arch: Arch::Unknown,
            vcpus: 1,
            memory: Size::from_mib(512),
            volumes: &[],
            interfaces: &[],
            config: None,
            guest_agent: false,
        }
        .render();
        assert!(!xml.contains("<metadata>"));
        assert!(!xml.contains("guest_agent"));
        assert!(xml.contains("arch='x86_64'"));
    }

    #[test]
    fn block_devices_use_dev_source() {
        let volume = VirtualMachineAttachedVolume {
            path: "/dev/vg0/data".into(),
            device_name: "vdb".into(),
            device_type: DeviceType::Disk,
            format: VolumeFormat::Raw,
            device_bus: DeviceBus::Virtio,
            volume_type: VolumeType::Block,
        };
        let xml = disk_xml(&volume);
        assert!(xml.starts_with("<disk type='block' device='disk'>"));
        assert!(xml.contains("<source dev='/dev/vg0/data'/>"));
    }

    #[test]
    fn disk_source_follows_volume_type_not_path() {
        let volume = VirtualMachineAttachedVolume {
            path: "/srv/luns/lun0".into(),
            device_name: "vdc".into(),
            volume_type: VolumeType::Block,
            ..Default::default()
        };
        let xml = format!("<domain><devices>{}</devices></domain>", disk_xml(&volume));
        assert!(xml.contains("<source dev='/srv/luns/lun0'/>"));

        let parsed = XmlParser::parse_domain(&xml);
        assert_eq!(parsed.volumes[0].volume_type, VolumeType::Block);
        assert_eq!(parsed.volumes[0].path, "/srv/luns/lun0");
    }

    #[test]
    fn libvirt_network_interface() {
        let xml = interface_xml(&VirtualMachineAttachedInterface {
            mac: "52:54:00:aa:bb:cc".into(),
            network_name: "default".into(),
            network_type: NetworkType::Libvirt,
            model: "e1000".into(),
            access_vlan: None,
            ip_address_list: Vec::new(),
        });
        assert!(xml.contains("<interface type='network'>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(!xml.contains("<vlan>"));
    }
}
